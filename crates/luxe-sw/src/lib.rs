//! # Luxe Offline Worker
//!
//! Offline asset cache manager for the Luxe site.
//!
//! ## Features
//!
//! - **Install**: all-or-nothing pre-caching of the static manifest
//! - **Activate**: removal of partitions from older versions, client claiming
//! - **Fetch Interception**: navigation, static asset and generic policies with offline fallbacks
//! - **Background Sync**: delivery of form submissions queued while offline
//!
//! ## Architecture
//!
//! ```text
//! OfflineCacheManager
//!     ├── WorkerLifecycle (Parsed → Installing → Installed → Activating → Activated)
//!     ├── ClientRegistry
//!     ├── Fetcher (network)
//!     ├── FormStore (FormStorage/forms)
//!     │       └── tag → pending fields
//!     └── CacheStorage
//!             ├── static-v1.0.0
//!             │       └── Request → Response
//!             └── dynamic-v1.0.0
//!                     └── Request → Response
//! ```

use luxe_common::LuxeError;
use luxe_idb::IDBError;
use luxe_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod manager;
pub mod strategy;
pub mod sync;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage};
pub use config::{CacheVersions, FormDbConfig, OfflineConfig, StaticManifest, SyncEndpoints};
pub use lifecycle::{Client, ClientRegistry, ClientType, WorkerId, WorkerLifecycle, WorkerState};
pub use manager::{OfflineCacheManager, OfflineEvent};
pub use strategy::{FetchPolicy, FetchResponse, ResponseSource};
pub use sync::{FormFields, FormStore, SyncOutcome, SyncTag};

// ==================== Errors ====================

/// Errors that can occur in offline worker operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<IDBError> for ServiceWorkerError {
    fn from(err: IDBError) -> Self {
        ServiceWorkerError::StorageError(err.to_string())
    }
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        ServiceWorkerError::NetworkError(err.to_string())
    }
}

impl From<ServiceWorkerError> for LuxeError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::InstallFailed(_) | ServiceWorkerError::StateError(_) => {
                LuxeError::lifecycle_with_source("worker lifecycle", err)
            }
            ServiceWorkerError::CacheError(_) => LuxeError::cache_with_source("cache storage", err),
            ServiceWorkerError::StorageError(_) => LuxeError::storage_with_source("form storage", err),
            ServiceWorkerError::NetworkError(_) => LuxeError::network_with_source("fetch", err),
            ServiceWorkerError::Config(message) => LuxeError::config(message),
            ServiceWorkerError::NotFound(what) => LuxeError::NotFound(what),
        }
    }
}
