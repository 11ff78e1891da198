//! Worker configuration: cache versions, static manifest, offline shell and sync endpoints.

use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::ServiceWorkerError;

/// Assets pre-cached at install time for the current release.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/about.html",
    "/contact.html",
    "/gallery.html",
    "/blog.html",
    "/reservation.html",
    "/faq.html",
    "/assets/css/main.css",
    "/assets/css/animations.css",
    "/assets/css/shared-components.css",
    "/assets/css/i18n.css",
    "/assets/js/main.js",
    "/assets/js/webgl-background.js",
    "/assets/js/animations.js",
    "/assets/js/shared-components.js",
    "/assets/js/i18n.js",
    "/assets/js/performance.js",
    "/assets/fonts/inter-variable.woff2",
    "/assets/fonts/playfair-display-variable.woff2",
    "/favicon.ico",
];

/// Offline worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Origin the worker is registered for. Manifest paths resolve against it.
    pub origin: Url,

    /// Cache partition names.
    pub versions: CacheVersions,

    /// Assets fetched into the static partition at install time.
    pub static_assets: StaticManifest,

    /// Document served for navigations when both cache and network fail.
    pub offline_shell: String,

    /// Endpoints the background sync tasks post to.
    pub endpoints: SyncEndpoints,

    /// Embedded database holding pending form submissions.
    pub form_db: FormDbConfig,
}

/// The three versioned names. Bumping one is how a deployment invalidates caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheVersions {
    pub overall: String,
    pub static_cache: String,
    pub dynamic_cache: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEndpoints {
    pub contact: String,
    pub reservation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormDbConfig {
    pub name: String,
    pub version: u64,
    pub store: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost/").expect("static origin is valid"),
            versions: CacheVersions::default(),
            static_assets: StaticManifest::default(),
            offline_shell: "/index.html".to_string(),
            endpoints: SyncEndpoints::default(),
            form_db: FormDbConfig::default(),
        }
    }
}

impl Default for CacheVersions {
    fn default() -> Self {
        Self {
            overall: "luxe-nightclub-v1.0.0".to_string(),
            static_cache: "static-v1.0.0".to_string(),
            dynamic_cache: "dynamic-v1.0.0".to_string(),
        }
    }
}

impl CacheVersions {
    /// Names that survive activation.
    pub fn current(&self) -> [&str; 2] {
        [&self.static_cache, &self.dynamic_cache]
    }

    /// Same naming scheme, different release tag.
    pub fn for_release(tag: &str) -> Self {
        Self {
            overall: format!("luxe-nightclub-{}", tag),
            static_cache: format!("static-{}", tag),
            dynamic_cache: format!("dynamic-{}", tag),
        }
    }
}

impl Default for SyncEndpoints {
    fn default() -> Self {
        Self {
            contact: "/api/contact".to_string(),
            reservation: "/api/reservation".to_string(),
        }
    }
}

impl Default for FormDbConfig {
    fn default() -> Self {
        Self {
            name: "FormStorage".to_string(),
            version: 1,
            store: "forms".to_string(),
        }
    }
}

impl OfflineConfig {
    /// Config for `origin` with every other field defaulted.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, ServiceWorkerError> {
        serde_json::to_string_pretty(self).map_err(|e| ServiceWorkerError::Config(e.to_string()))
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.static_assets.is_empty() {
            return Err(ServiceWorkerError::Config("static manifest is empty".to_string()));
        }
        if let Some(bad) = self.static_assets.paths().iter().find(|p| !p.starts_with('/')) {
            return Err(ServiceWorkerError::Config(format!(
                "manifest entry is not an absolute path: {}",
                bad
            )));
        }
        if self.versions.static_cache == self.versions.dynamic_cache {
            return Err(ServiceWorkerError::Config(
                "static and dynamic partitions must have different names".to_string(),
            ));
        }
        if !self.static_assets.contains(&self.offline_shell) {
            return Err(ServiceWorkerError::Config(format!(
                "offline shell {} is not in the static manifest",
                self.offline_shell
            )));
        }
        for endpoint in [&self.endpoints.contact, &self.endpoints.reservation] {
            if !endpoint.starts_with('/') {
                return Err(ServiceWorkerError::Config(format!(
                    "sync endpoint is not an absolute path: {}",
                    endpoint
                )));
            }
        }
        if self.form_db.version == 0 {
            return Err(ServiceWorkerError::Config(
                "form database version must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve an origin-relative path.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::Config(format!("cannot resolve {}: {}", path, e)))
    }

    /// Whether `url` belongs to the configured origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }
}

/// Ordered list of origin-relative asset paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticManifest {
    paths: Vec<String>,
}

impl Default for StaticManifest {
    fn default() -> Self {
        Self::new(DEFAULT_STATIC_ASSETS.iter().copied())
    }
}

impl StaticManifest {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Exact path membership.
    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    /// Absolute URLs for every entry, in manifest order.
    pub fn urls(&self, origin: &Url) -> Result<Vec<Url>, url::ParseError> {
        self.paths.iter().map(|p| origin.join(p)).collect()
    }
}
