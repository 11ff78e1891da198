//! # Luxe IDB
//!
//! Small embedded object store modelled on IndexedDB, used by the offline
//! worker to hold form submissions that could not reach the network.
//!
//! ## Features
//!
//! - **IDBFactory**: `open()` with upgrade callback, `delete_database()`
//! - **IDBDatabase**: object store management
//! - **IDBObjectStore**: get / add / put / delete
//! - **IDBTransaction**: readonly and readwrite scopes, rollback on abort
//! - **Snapshots**: JSON persistence of every database
//!
//! ## Architecture
//!
//! ```text
//! IDBFactory
//!     │
//!     └── IDBDatabase (name, version)
//!             │
//!             ├── IDBObjectStore
//!             │       └── Records (key -> JSON value)
//!             │
//!             └── IDBTransaction (mode, scope)
//! ```

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

// ==================== Errors ====================

/// IndexedDB errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IDBError {
    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Constraint error: {0}")]
    ConstraintError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Invalid state: {0}")]
    InvalidStateError(String),

    #[error("Transaction inactive")]
    TransactionInactiveError,

    #[error("Read only")]
    ReadOnlyError,

    #[error("Version error: {0}")]
    VersionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<serde_json::Error> for IDBError {
    fn from(e: serde_json::Error) -> Self {
        IDBError::SerializationError(e.to_string())
    }
}

impl From<std::io::Error> for IDBError {
    fn from(e: std::io::Error) -> Self {
        IDBError::IoError(e.to_string())
    }
}

// ==================== Types ====================

/// Key path for object stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// No key path (out-of-line keys).
    None,
    /// Single property.
    Single(String),
}

impl KeyPath {
    /// Extract key from value.
    pub fn extract(&self, value: &JsonValue) -> Option<JsonValue> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => value.get(path).cloned(),
        }
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: JsonValue,
    pub value: JsonValue,
}

// ==================== IDBObjectStore ====================

/// An object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IDBObjectStore {
    /// Store name.
    pub name: String,

    /// Key path.
    pub key_path: KeyPath,

    /// Auto-increment.
    pub auto_increment: bool,

    records: HashMap<String, Record>,

    next_key: u64,
}

impl IDBObjectStore {
    /// Create a new object store.
    pub fn new(name: &str, key_path: KeyPath, auto_increment: bool) -> Self {
        Self {
            name: name.to_string(),
            key_path,
            auto_increment,
            records: HashMap::new(),
            next_key: 1,
        }
    }

    /// Get a record.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Get all keys, sorted.
    pub fn get_all_keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.records.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    /// Add a record (fails if key exists).
    pub fn add(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<String, IDBError> {
        let key = self.resolve_key(&value, key)?;
        let key_str = json_to_key_string(&key);

        if self.records.contains_key(&key_str) {
            return Err(IDBError::ConstraintError(format!(
                "Key already exists: {}",
                key_str
            )));
        }

        self.records.insert(key_str.clone(), Record { key, value });
        Ok(key_str)
    }

    /// Put a record (overwrites if exists).
    pub fn put(&mut self, value: JsonValue, key: Option<JsonValue>) -> Result<String, IDBError> {
        let key = self.resolve_key(&value, key)?;
        let key_str = json_to_key_string(&key);

        if self.records.contains_key(&key_str) {
            debug!(store = %self.name, key = %key_str, "Overwriting record");
        }

        self.records.insert(key_str.clone(), Record { key, value });
        Ok(key_str)
    }

    /// Delete a record.
    pub fn delete(&mut self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Clear all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Count records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    fn resolve_key(&mut self, value: &JsonValue, key: Option<JsonValue>) -> Result<JsonValue, IDBError> {
        match (&self.key_path, key, self.auto_increment) {
            (KeyPath::Single(_), Some(_), _) => Err(IDBError::DataError(
                "Explicit key not allowed for a store with an in-line key path".to_string(),
            )),

            (KeyPath::None, Some(k), _) => Ok(k),

            (KeyPath::Single(_), None, _) => self.key_path.extract(value).ok_or_else(|| {
                IDBError::DataError("Could not extract key from value".to_string())
            }),

            (KeyPath::None, None, true) => {
                let key = self.next_key;
                self.next_key += 1;
                Ok(JsonValue::Number(key.into()))
            }

            (KeyPath::None, None, false) => Err(IDBError::DataError(
                "No key provided and no auto-increment".to_string(),
            )),
        }
    }
}

// ==================== IDBTransaction ====================

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Finished,
}

/// A database transaction.
#[derive(Debug)]
pub struct IDBTransaction {
    /// Transaction mode.
    pub mode: TransactionMode,

    /// Object store names in scope.
    pub scope: Vec<String>,

    /// State.
    pub state: TransactionState,

    /// Error if aborted.
    pub error: Option<IDBError>,
}

impl IDBTransaction {
    /// Create a new transaction.
    pub fn new(mode: TransactionMode, scope: Vec<String>) -> Self {
        Self {
            mode,
            scope,
            state: TransactionState::Active,
            error: None,
        }
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Check if store is in scope.
    pub fn has_store(&self, name: &str) -> bool {
        self.scope.iter().any(|s| s == name)
    }

    /// Abort the transaction.
    pub fn abort(&mut self, error: IDBError) {
        self.state = TransactionState::Finished;
        self.error = Some(error);
    }

    /// Commit the transaction.
    pub fn commit(&mut self) {
        self.state = TransactionState::Finished;
    }

    fn check_access(&self, name: &str, write: bool) -> Result<(), IDBError> {
        if !self.is_active() {
            return Err(IDBError::TransactionInactiveError);
        }
        if !self.has_store(name) {
            return Err(IDBError::NotFoundError(format!(
                "Object store not in transaction scope: {}",
                name
            )));
        }
        if write && self.mode == TransactionMode::ReadOnly {
            return Err(IDBError::ReadOnlyError);
        }
        Ok(())
    }
}

// ==================== IDBDatabase ====================

/// A database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IDBDatabase {
    /// Database name.
    pub name: String,

    /// Version.
    pub version: u64,

    stores: HashMap<String, IDBObjectStore>,
}

impl IDBDatabase {
    /// Create a new database.
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stores: HashMap::new(),
        }
    }

    /// Get object store names.
    pub fn object_store_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.stores.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Create object store (only during an upgrade).
    pub fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<(), IDBError> {
        if self.stores.contains_key(name) {
            return Err(IDBError::ConstraintError(format!(
                "Object store already exists: {}",
                name
            )));
        }

        self.stores.insert(
            name.to_string(),
            IDBObjectStore::new(name, key_path, auto_increment),
        );
        Ok(())
    }

    /// Delete object store (only during an upgrade).
    pub fn delete_object_store(&mut self, name: &str) -> Result<(), IDBError> {
        self.stores.remove(name).ok_or_else(|| {
            IDBError::NotFoundError(format!("Object store not found: {}", name))
        })?;
        Ok(())
    }

    /// Check whether an object store exists.
    pub fn has_object_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Start a transaction.
    pub fn transaction(&self, stores: &[&str], mode: TransactionMode) -> Result<IDBTransaction, IDBError> {
        for name in stores {
            if !self.stores.contains_key(*name) {
                return Err(IDBError::NotFoundError(format!(
                    "Object store not found: {}",
                    name
                )));
            }
        }

        Ok(IDBTransaction::new(
            mode,
            stores.iter().map(|s| s.to_string()).collect(),
        ))
    }

    /// Object store for reading within a transaction.
    pub fn store(&self, tx: &IDBTransaction, name: &str) -> Result<&IDBObjectStore, IDBError> {
        tx.check_access(name, false)?;
        self.stores
            .get(name)
            .ok_or_else(|| IDBError::NotFoundError(format!("Object store not found: {}", name)))
    }

    /// Object store for writing within a readwrite transaction.
    pub fn store_mut(&mut self, tx: &IDBTransaction, name: &str) -> Result<&mut IDBObjectStore, IDBError> {
        tx.check_access(name, true)?;
        self.stores
            .get_mut(name)
            .ok_or_else(|| IDBError::NotFoundError(format!("Object store not found: {}", name)))
    }
}

// ==================== IDBFactory ====================

/// IDBFactory events.
#[derive(Debug, Clone)]
pub enum IDBEvent {
    /// Upgrade needed.
    UpgradeNeeded {
        db_name: String,
        old_version: u64,
        new_version: u64,
    },
    /// Database opened.
    Success { db_name: String },
    /// Error occurred.
    Error { db_name: String, error: IDBError },
}

/// Database info for `databases()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

/// Database registry shared by every page and worker of one origin.
pub struct IDBFactory {
    databases: Arc<RwLock<HashMap<String, IDBDatabase>>>,

    event_tx: mpsc::UnboundedSender<IDBEvent>,
}

impl IDBFactory {
    /// Create a new factory.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IDBEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (Self {
            databases: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }, event_rx)
    }

    /// Open a database, running `upgrade` when the requested version is newer.
    ///
    /// A failed upgrade leaves the database exactly as it was.
    pub async fn open<F>(&self, name: &str, version: u64, upgrade: F) -> Result<DatabaseInfo, IDBError>
    where
        F: FnOnce(&mut IDBDatabase, u64) -> Result<(), IDBError>,
    {
        let mut databases = self.databases.write().await;

        let current_version = databases.get(name).map(|db| db.version).unwrap_or(0);

        if version < current_version {
            let error = IDBError::VersionError(format!(
                "Requested version {} is less than current version {}",
                version, current_version
            ));
            let _ = self.event_tx.send(IDBEvent::Error {
                db_name: name.to_string(),
                error: error.clone(),
            });
            return Err(error);
        }

        if version > current_version {
            let _ = self.event_tx.send(IDBEvent::UpgradeNeeded {
                db_name: name.to_string(),
                old_version: current_version,
                new_version: version,
            });

            let mut db = databases
                .get(name)
                .cloned()
                .unwrap_or_else(|| IDBDatabase::new(name, 0));
            db.version = version;

            if let Err(error) = upgrade(&mut db, current_version) {
                warn!(db = %name, %error, "Upgrade aborted");
                let _ = self.event_tx.send(IDBEvent::Error {
                    db_name: name.to_string(),
                    error: error.clone(),
                });
                return Err(error);
            }

            info!(db = %name, old_version = current_version, new_version = version, "Database upgraded");
            databases.insert(name.to_string(), db);
        }

        let _ = self.event_tx.send(IDBEvent::Success {
            db_name: name.to_string(),
        });

        Ok(DatabaseInfo {
            name: name.to_string(),
            version,
        })
    }

    /// Delete a database.
    pub async fn delete_database(&self, name: &str) -> bool {
        self.databases.write().await.remove(name).is_some()
    }

    /// List databases, sorted by name.
    pub async fn databases(&self) -> Vec<DatabaseInfo> {
        let databases = self.databases.read().await;
        let mut infos: Vec<_> = databases
            .iter()
            .map(|(name, db)| DatabaseInfo {
                name: name.clone(),
                version: db.version,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Run a readonly transaction over `stores`.
    pub async fn read<F, R>(&self, db_name: &str, stores: &[&str], f: F) -> Result<R, IDBError>
    where
        F: FnOnce(&IDBDatabase, &IDBTransaction) -> Result<R, IDBError>,
    {
        let databases = self.databases.read().await;
        let db = databases.get(db_name).ok_or_else(|| {
            IDBError::NotFoundError(format!("Database not found: {}", db_name))
        })?;

        let mut tx = db.transaction(stores, TransactionMode::ReadOnly)?;
        match f(db, &tx) {
            Ok(value) => {
                tx.commit();
                Ok(value)
            }
            Err(e) => {
                tx.abort(e.clone());
                Err(e)
            }
        }
    }

    /// Run a readwrite transaction over `stores`.
    ///
    /// When `f` fails, every store in scope is restored to its state before
    /// the transaction.
    pub async fn write<F, R>(&self, db_name: &str, stores: &[&str], f: F) -> Result<R, IDBError>
    where
        F: FnOnce(&mut IDBDatabase, &IDBTransaction) -> Result<R, IDBError>,
    {
        let mut databases = self.databases.write().await;
        let db = databases.get_mut(db_name).ok_or_else(|| {
            IDBError::NotFoundError(format!("Database not found: {}", db_name))
        })?;

        let mut tx = db.transaction(stores, TransactionMode::ReadWrite)?;
        let saved: Vec<IDBObjectStore> = stores
            .iter()
            .filter_map(|name| db.stores.get(*name).cloned())
            .collect();

        match f(db, &tx) {
            Ok(value) => {
                tx.commit();
                Ok(value)
            }
            Err(e) => {
                for store in saved {
                    db.stores.insert(store.name.clone(), store);
                }
                debug!(db = %db_name, error = %e, "Transaction rolled back");
                tx.abort(e.clone());
                Err(e)
            }
        }
    }

    /// Serialize every database to JSON.
    pub async fn snapshot(&self) -> Result<String, IDBError> {
        let databases = self.databases.read().await;
        Ok(serde_json::to_string_pretty(&*databases)?)
    }

    /// Replace every database with the contents of a JSON snapshot.
    pub async fn restore(&self, json: &str) -> Result<(), IDBError> {
        let restored: HashMap<String, IDBDatabase> = serde_json::from_str(json)?;
        *self.databases.write().await = restored;
        Ok(())
    }

    /// Write a snapshot to `path`.
    pub async fn save_to(&self, path: &Path) -> Result<(), IDBError> {
        let json = self.snapshot().await?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Database snapshot saved");
        Ok(())
    }

    /// Restore from a snapshot at `path`. A missing file leaves the factory empty.
    pub async fn load_from(&self, path: &Path) -> Result<(), IDBError> {
        match std::fs::read_to_string(path) {
            Ok(json) => self.restore(&json).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for IDBFactory {
    fn default() -> Self {
        Self::new().0
    }
}

// ==================== Helpers ====================

/// Convert JSON value to key string.
pub fn json_to_key_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(json_to_key_string).collect();
            format!("[{}]", parts.join(","))
        }
        _ => value.to_string(),
    }
}
