//! Named cache partitions keyed by request identity (method + URL).

use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use luxe_net::{Request, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, trace, warn};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys ====================

/// Request identity. Headers and the URL fragment take no part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            url: without_fragment(&request.url),
        }
    }

    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.as_str().to_string(),
            url: without_fragment(url),
        }
    }

    fn is_get(&self) -> bool {
        self.method == Method::GET.as_str()
    }
}

fn without_fragment(url: &Url) -> String {
    if url.fragment().is_none() {
        return url.as_str().to_string();
    }
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Repeated names keep every value.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for storage.
    pub fn from_response(key: &CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => trace!(header = %name, "Dropping unrepresentable cached header"),
            }
        }

        let mut response = Response::new(status, self.body.clone());
        response.headers = headers;
        response.url = Url::parse(&self.url).ok();
        response
    }

    fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

// ==================== Cache ====================

/// One named partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Entries keyed by `"METHOD URL"`.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests can match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.match_key(&CacheKey::for_request(request))
    }

    /// Match by key.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        if !key.is_get() {
            return None;
        }
        self.entries.get(&key.to_string())
    }

    /// Store a response, replacing any previous one for the same request.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<(), ServiceWorkerError> {
        self.put_key(CacheKey::for_request(request), response)
    }

    /// Store a response under `key`.
    pub fn put_key(&mut self, key: CacheKey, response: &Response) -> Result<(), ServiceWorkerError> {
        if !key.is_get() {
            return Err(ServiceWorkerError::CacheError(format!(
                "request method {} is unsupported by cache {}",
                key.method, self.name
            )));
        }

        trace!(cache = %self.name, key = %key, status = response.status.as_u16(), "Cache put");
        let entry = CacheEntry::from_response(&key, response);
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(&key.to_string()).is_some()
    }

    /// All request identities, sorted by URL.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.entries.values().map(CacheEntry::key).collect();
        keys.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.method.cmp(&b.method)));
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All partitions of one origin, in creation order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if it doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            debug!(cache = %name, "Creating cache partition");
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Get an existing cache.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Get all cache names in creation order.
    pub fn keys(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Match across all caches, oldest partition first.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.match_key(&CacheKey::for_request(request))
    }

    /// Match a key across all caches, oldest partition first.
    pub fn match_key(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_key(key))
    }

    /// Serialize every partition to JSON.
    pub fn snapshot(&self) -> Result<String, ServiceWorkerError> {
        serde_json::to_string(self).map_err(|e| ServiceWorkerError::StorageError(e.to_string()))
    }

    /// Rebuild storage from a JSON snapshot.
    pub fn restore(json: &str) -> Result<Self, ServiceWorkerError> {
        let mut storage: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::StorageError(e.to_string()))?;

        let before = storage.order.len();
        let caches = &storage.caches;
        storage.order.retain(|name| caches.contains_key(name));
        if storage.order.len() != before {
            warn!("Snapshot listed partitions without contents; dropped them");
        }
        for name in storage.caches.keys() {
            if !storage.order.contains(name) {
                storage.order.push(name.clone());
            }
        }
        Ok(storage)
    }

    /// Write a snapshot to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        std::fs::write(path, self.snapshot()?)
            .map_err(|e| ServiceWorkerError::StorageError(format!("{}: {}", path.display(), e)))
    }

    /// Load a snapshot from `path`. A missing file yields empty storage.
    pub fn load_from(path: &Path) -> Result<Self, ServiceWorkerError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::restore(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(ServiceWorkerError::StorageError(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
