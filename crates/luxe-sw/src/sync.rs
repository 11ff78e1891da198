//! Background sync tags and the store of form submissions awaiting delivery.

use luxe_idb::{IDBFactory, KeyPath};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{FormDbConfig, SyncEndpoints};
use crate::ServiceWorkerError;

/// Serialized form field map.
pub type FormFields = serde_json::Map<String, JsonValue>;

/// Background sync task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTag {
    ContactForm,
    ReservationForm,
}

impl SyncTag {
    pub const ALL: [SyncTag; 2] = [SyncTag::ContactForm, SyncTag::ReservationForm];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTag::ContactForm => "contact-form",
            SyncTag::ReservationForm => "reservation-form",
        }
    }

    /// Endpoint path this form is delivered to.
    pub fn endpoint<'a>(&self, endpoints: &'a SyncEndpoints) -> &'a str {
        match self {
            SyncTag::ContactForm => &endpoints.contact,
            SyncTag::ReservationForm => &endpoints.reservation,
        }
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTag {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact-form" => Ok(SyncTag::ContactForm),
            "reservation-form" => Ok(SyncTag::ReservationForm),
            other => Err(ServiceWorkerError::NotFound(format!("sync tag {}", other))),
        }
    }
}

/// Result of one sync attempt. Never an error: failures leave the record for the next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No submission was waiting.
    NothingPending,
    /// Posted and removed from the store.
    Delivered,
    /// Delivery failed; the record is untouched.
    Failed { reason: String },
    /// Tag does not name a known task.
    UnknownTag(String),
}

/// Pending submissions, one per form type.
#[derive(Clone)]
pub struct FormStore {
    factory: Arc<IDBFactory>,
    config: FormDbConfig,
}

impl FormStore {
    /// Open (and on first use create) the form database.
    pub async fn open(factory: Arc<IDBFactory>, config: FormDbConfig) -> Result<Self, ServiceWorkerError> {
        let store = config.store.clone();
        factory
            .open(&config.name, config.version, |db, old_version| {
                if !db.has_object_store(&store) {
                    debug!(store = %store, old_version, "Creating form object store");
                    db.create_object_store(&store, KeyPath::None, false)?;
                }
                Ok(())
            })
            .await?;

        Ok(Self { factory, config })
    }

    /// Queue a submission, replacing any pending one of the same type.
    pub async fn save_pending(&self, tag: SyncTag, fields: FormFields) -> Result<(), ServiceWorkerError> {
        let store = self.config.store.as_str();
        self.factory
            .write(&self.config.name, &[store], |db, tx| {
                db.store_mut(tx, store)?
                    .put(JsonValue::Object(fields), Some(JsonValue::from(tag.as_str())))
            })
            .await?;
        info!(tag = %tag, "Form submission queued for background sync");
        Ok(())
    }

    /// The pending submission for `tag`, if any.
    pub async fn pending(&self, tag: SyncTag) -> Result<Option<FormFields>, ServiceWorkerError> {
        let store = self.config.store.as_str();
        let value = self
            .factory
            .read(&self.config.name, &[store], |db, tx| {
                Ok(db.store(tx, store)?.get(tag.as_str()).map(|r| r.value.clone()))
            })
            .await?;

        match value {
            None => Ok(None),
            Some(JsonValue::Object(fields)) => Ok(Some(fields)),
            Some(other) => Err(ServiceWorkerError::StorageError(format!(
                "pending {} is not a field map: {}",
                tag, other
            ))),
        }
    }

    /// Remove the pending submission. Returns whether one existed.
    pub async fn clear(&self, tag: SyncTag) -> Result<bool, ServiceWorkerError> {
        let store = self.config.store.as_str();
        let removed = self
            .factory
            .write(&self.config.name, &[store], |db, tx| {
                Ok(db.store_mut(tx, store)?.delete(tag.as_str()))
            })
            .await?;
        Ok(removed)
    }

    pub fn factory(&self) -> &Arc<IDBFactory> {
        &self.factory
    }
}
