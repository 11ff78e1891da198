//! The offline cache manager: lifecycle, fetch interception and background sync.

use futures::future::try_join_all;
use http::Method;
use luxe_net::{Fetcher, Request, RequestDestination, Response};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStorage};
use crate::config::OfflineConfig;
use crate::lifecycle::{ClientRegistry, WorkerId, WorkerLifecycle, WorkerState};
use crate::strategy::{
    is_cacheable, offline_placeholder, wants_placeholder, FetchPolicy, FetchResponse, ResponseSource,
};
use crate::sync::{FormStore, SyncOutcome, SyncTag};
use crate::ServiceWorkerError;

/// Events emitted while the worker runs.
#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    /// Lifecycle state changed.
    StateChange {
        worker_id: WorkerId,
        from: WorkerState,
        to: WorkerState,
    },
    /// Install finished; the worker wants to take over without waiting.
    SkipWaiting { worker_id: WorkerId },
    /// A partition from another version was removed during activation.
    PartitionDeleted { name: String },
    /// Open clients were claimed after activation.
    ClientsClaimed { worker_id: WorkerId, count: usize },
    /// A background sync attempt finished.
    SyncCompleted { tag: SyncTag, outcome: SyncOutcome },
}

/// Offline asset cache manager for one worker instance.
///
/// Storage, network and the form database are injected, so the manager runs
/// the same against a browser-backed environment or in-memory test doubles.
pub struct OfflineCacheManager {
    config: OfflineConfig,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    forms: FormStore,
    clients: Arc<RwLock<ClientRegistry>>,
    lifecycle: RwLock<WorkerLifecycle>,
    event_tx: mpsc::UnboundedSender<OfflineEvent>,
}

impl OfflineCacheManager {
    /// Create a manager. Fails only if `config` does not validate.
    pub fn new(
        config: OfflineConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
        forms: FormStore,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OfflineEvent>), ServiceWorkerError> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let lifecycle = WorkerLifecycle::new();

        info!(
            worker_id = lifecycle.id.raw(),
            origin = %config.origin,
            static_cache = %config.versions.static_cache,
            dynamic_cache = %config.versions.dynamic_cache,
            "Offline cache manager created"
        );

        Ok((
            Self {
                config,
                caches,
                fetcher,
                forms,
                clients: Arc::new(RwLock::new(ClientRegistry::new())),
                lifecycle: RwLock::new(lifecycle),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    pub fn clients(&self) -> Arc<RwLock<ClientRegistry>> {
        Arc::clone(&self.clients)
    }

    pub fn forms(&self) -> &FormStore {
        &self.forms
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.read().await.state
    }

    pub async fn worker_id(&self) -> WorkerId {
        self.lifecycle.read().await.id
    }

    pub async fn is_active(&self) -> bool {
        self.lifecycle.read().await.is_active()
    }

    async fn transition(&self, next: WorkerState) -> Result<(), ServiceWorkerError> {
        let mut lifecycle = self.lifecycle.write().await;
        let from = lifecycle.transition(next)?;
        debug!(worker_id = lifecycle.id.raw(), ?from, to = ?next, "Worker state changed");
        let _ = self.event_tx.send(OfflineEvent::StateChange {
            worker_id: lifecycle.id,
            from,
            to: next,
        });
        Ok(())
    }

    // ==================== Install ====================

    /// Populate the static partition from the manifest.
    ///
    /// All-or-nothing: any failed or non-2xx asset fails the install, the
    /// worker becomes redundant and the static partition is left untouched.
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        self.transition(WorkerState::Installing).await?;

        match self.populate_static().await {
            Ok(count) => {
                self.transition(WorkerState::Installed).await?;
                info!(
                    cache = %self.config.versions.static_cache,
                    assets = count,
                    "Static assets cached"
                );
                let worker_id = self.worker_id().await;
                let _ = self.event_tx.send(OfflineEvent::SkipWaiting { worker_id });
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "Install failed; previous worker stays in control");
                self.transition(WorkerState::Redundant).await?;
                Err(e)
            }
        }
    }

    async fn populate_static(&self) -> Result<usize, ServiceWorkerError> {
        let urls = self
            .config
            .static_assets
            .urls(&self.config.origin)
            .map_err(|e| ServiceWorkerError::Config(e.to_string()))?;

        let fetches = urls.into_iter().map(|url| async move {
            let destination = RequestDestination::from_path(url.path());
            let request = Request::get(url).with_destination(destination);
            match self.fetcher.fetch(&request).await {
                Ok(response) if response.ok() => Ok((request, response)),
                Ok(response) => Err(ServiceWorkerError::InstallFailed(format!(
                    "{} returned {}",
                    request.url, response.status
                ))),
                Err(e) => Err(ServiceWorkerError::InstallFailed(format!(
                    "{}: {}",
                    request.url, e
                ))),
            }
        });

        let fetched = try_join_all(fetches).await?;

        let mut caches = self.caches.write().await;
        let cache = caches.open(&self.config.versions.static_cache);
        for (request, response) in &fetched {
            cache.put(request, response)?;
        }
        Ok(fetched.len())
    }

    /// Bring a worker back to `Activated` from partitions persisted by an earlier run.
    ///
    /// Fails without touching the network unless every manifest entry is
    /// already present in the current static partition.
    pub async fn resume(&self) -> Result<(), ServiceWorkerError> {
        let urls = self
            .config
            .static_assets
            .urls(&self.config.origin)
            .map_err(|e| ServiceWorkerError::Config(e.to_string()))?;

        {
            let caches = self.caches.read().await;
            let cache = caches.get(&self.config.versions.static_cache).ok_or_else(|| {
                ServiceWorkerError::NotFound(format!(
                    "cache partition {}",
                    self.config.versions.static_cache
                ))
            })?;
            if let Some(missing) = urls.iter().find(|url| cache.match_key(&CacheKey::get(url)).is_none()) {
                return Err(ServiceWorkerError::NotFound(format!("cached asset {}", missing)));
            }
        }

        for state in [
            WorkerState::Installing,
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Activated,
        ] {
            self.transition(state).await?;
        }
        info!(cache = %self.config.versions.static_cache, "Worker resumed from persisted caches");
        Ok(())
    }

    // ==================== Activate ====================

    /// Drop partitions of other versions, then claim every open client.
    ///
    /// Returns the number of partitions deleted.
    pub async fn activate(&self) -> Result<usize, ServiceWorkerError> {
        self.transition(WorkerState::Activating).await?;

        let deleted = {
            let mut caches = self.caches.write().await;
            let current = self.config.versions.current();
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| !current.contains(&name.as_str()))
                .collect();

            let mut deleted = 0;
            for name in &stale {
                if caches.delete(name) {
                    deleted += 1;
                    info!(cache = %name, "Deleted stale cache partition");
                    let _ = self.event_tx.send(OfflineEvent::PartitionDeleted { name: name.clone() });
                }
            }
            deleted
        };

        let worker_id = self.worker_id().await;
        let count = self.clients.write().await.claim(worker_id);
        debug!(worker_id = worker_id.raw(), count, "Clients claimed");
        let _ = self.event_tx.send(OfflineEvent::ClientsClaimed { worker_id, count });

        self.transition(WorkerState::Activated).await?;
        Ok(deleted)
    }

    // ==================== Fetch ====================

    /// Which policy would serve `request`.
    pub fn select_policy(&self, request: &Request) -> FetchPolicy {
        FetchPolicy::select(request, &self.config)
    }

    /// Answer an intercepted request. `None` means the load fails as a network error.
    pub async fn handle_fetch(&self, request: &Request) -> Option<FetchResponse> {
        if !self.is_active().await {
            debug!(url = %request.url, "Worker not active; passing request through");
            return self
                .fetcher
                .fetch(request)
                .await
                .ok()
                .map(|r| FetchResponse::new(r, ResponseSource::Network));
        }

        let policy = self.select_policy(request);
        debug!(url = %request.url, policy = policy.as_str(), "Intercepted fetch");

        match policy {
            FetchPolicy::Navigation => self.serve_navigation(request).await,
            FetchPolicy::StaticAsset => self.serve_static(request).await,
            FetchPolicy::Generic => self.serve_generic(request).await,
        }
    }

    async fn serve_navigation(&self, request: &Request) -> Option<FetchResponse> {
        if let Some(hit) = self.cache_lookup(request).await {
            return Some(FetchResponse::new(hit, ResponseSource::Cache));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_dynamic(request, &response).await;
                Some(FetchResponse::new(response, ResponseSource::Network))
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Navigation failed; serving offline shell");
                let shell = self.offline_shell().await;
                if shell.is_none() {
                    error!(shell = %self.config.offline_shell, "Offline shell is not cached");
                }
                shell.map(|r| FetchResponse::new(r, ResponseSource::OfflineShell))
            }
        }
    }

    async fn serve_static(&self, request: &Request) -> Option<FetchResponse> {
        if let Some(hit) = self.cache_lookup(request).await {
            return Some(FetchResponse::new(hit, ResponseSource::Cache));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => Some(FetchResponse::new(response, ResponseSource::Network)),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Static asset missing from cache and network");
                None
            }
        }
    }

    async fn serve_generic(&self, request: &Request) -> Option<FetchResponse> {
        if let Some(hit) = self.cache_lookup(request).await {
            return Some(FetchResponse::new(hit, ResponseSource::Cache));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_dynamic(request, &response).await;
                Some(FetchResponse::new(response, ResponseSource::Network))
            }
            Err(e) if wants_placeholder(request) => {
                debug!(url = %request.url, error = %e, "Serving offline image placeholder");
                Some(FetchResponse::new(
                    offline_placeholder(),
                    ResponseSource::OfflinePlaceholder,
                ))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Fetch failed with no fallback");
                None
            }
        }
    }

    async fn cache_lookup(&self, request: &Request) -> Option<Response> {
        let caches = self.caches.read().await;
        caches.match_request(request).map(|entry| entry.to_response())
    }

    async fn offline_shell(&self) -> Option<Response> {
        let url: Url = self.config.resolve(&self.config.offline_shell).ok()?;
        let caches = self.caches.read().await;
        caches
            .match_key(&CacheKey::get(&url))
            .map(|entry| entry.to_response())
    }

    /// Write a copy of a 200 response into the dynamic partition. Failures only log.
    async fn store_dynamic(&self, request: &Request, response: &Response) {
        if request.method != Method::GET || !is_cacheable(response) {
            debug!(url = %request.url, status = response.status.as_u16(), "Not caching response");
            return;
        }

        let mut caches = self.caches.write().await;
        let cache = caches.open(&self.config.versions.dynamic_cache);
        if let Err(e) = cache.put(request, response) {
            warn!(url = %request.url, error = %e, "Could not cache response");
        }
    }

    // ==================== Background sync ====================

    /// Run the sync task named by `tag`.
    pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
        let tag = match tag.parse::<SyncTag>() {
            Ok(tag) => tag,
            Err(_) => {
                warn!(tag = %tag, "Ignoring unknown sync tag");
                return SyncOutcome::UnknownTag(tag.to_string());
            }
        };

        let outcome = self.sync_form(tag).await;
        let _ = self.event_tx.send(OfflineEvent::SyncCompleted {
            tag,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Run every sync task once.
    pub async fn sync_all(&self) -> Vec<(SyncTag, SyncOutcome)> {
        let mut outcomes = Vec::with_capacity(SyncTag::ALL.len());
        for tag in SyncTag::ALL {
            outcomes.push((tag, self.handle_sync(tag.as_str()).await));
        }
        outcomes
    }

    async fn sync_form(&self, tag: SyncTag) -> SyncOutcome {
        let fields = match self.forms.pending(tag).await {
            Ok(Some(fields)) => fields,
            Ok(None) => {
                debug!(tag = %tag, "No pending submission");
                return SyncOutcome::NothingPending;
            }
            Err(e) => {
                error!(tag = %tag, error = %e, "Failed to read pending submission");
                return SyncOutcome::Failed { reason: e.to_string() };
            }
        };

        let request = match self
            .config
            .resolve(tag.endpoint(&self.config.endpoints))
            .and_then(|url| Request::post_json(url, &fields).map_err(ServiceWorkerError::from))
        {
            Ok(request) => request,
            Err(e) => {
                error!(tag = %tag, error = %e, "Failed to build sync request");
                return SyncOutcome::Failed { reason: e.to_string() };
            }
        };

        match self.fetcher.fetch(&request).await {
            Ok(response) if response.ok() => match self.forms.clear(tag).await {
                Ok(_) => {
                    info!(tag = %tag, url = %request.url, "Pending submission delivered");
                    SyncOutcome::Delivered
                }
                Err(e) => {
                    error!(tag = %tag, error = %e, "Delivered but could not clear pending submission");
                    SyncOutcome::Failed { reason: e.to_string() }
                }
            },
            Ok(response) => {
                error!(tag = %tag, status = response.status.as_u16(), "Failed to sync form");
                SyncOutcome::Failed {
                    reason: format!("server responded {}", response.status),
                }
            }
            Err(e) => {
                error!(tag = %tag, error = %e, "Failed to sync form");
                SyncOutcome::Failed { reason: e.to_string() }
            }
        }
    }
}
