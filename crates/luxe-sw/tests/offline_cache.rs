//! End-to-end behavior of the offline cache manager against a scripted network.

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use http::{Method, StatusCode};
use luxe_idb::IDBFactory;
use luxe_net::{Fetcher, NetError, Request, RequestDestination, Response};
use luxe_sw::{
    CacheStorage, CacheVersions, Client, FetchPolicy, FormStore, OfflineCacheManager, OfflineConfig,
    OfflineEvent, ResponseSource, StaticManifest, SyncOutcome, SyncTag, WorkerState,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use url::Url;

const ORIGIN: &str = "https://luxe.example/";

// ==================== Scripted network ====================

/// Network double: fixed responses per path, failures on demand, call counting.
#[derive(Default)]
struct ScriptedFetcher {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    log: Mutex<Vec<(Method, String, Vec<u8>)>>,
}

impl ScriptedFetcher {
    fn route(&self, path: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn posts(&self) -> Vec<(String, Vec<u8>)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(method, _, _)| *method == Method::POST)
            .map(|(_, path, body)| (path.clone(), body.clone()))
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.url.path().to_string();
        self.log.lock().unwrap().push((
            request.method.clone(),
            path.clone(),
            request.body.as_ref().map(|b| b.to_vec()).unwrap_or_default(),
        ));

        if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&path) {
            return Err(NetError::RequestFailed(format!("{} unreachable", path)));
        }

        let routes = self.routes.lock().unwrap();
        Ok(match routes.get(&path) {
            Some((status, body)) => Response::new(*status, body.clone()),
            None => Response::new(StatusCode::NOT_FOUND, "not found"),
        })
    }
}

// ==================== Harness ====================

struct Harness {
    manager: OfflineCacheManager,
    events: mpsc::UnboundedReceiver<OfflineEvent>,
    fetcher: Arc<ScriptedFetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    forms: FormStore,
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn small_config() -> OfflineConfig {
    let mut config = OfflineConfig::for_origin(Url::parse(ORIGIN).unwrap());
    config.static_assets = StaticManifest::new(["/", "/index.html", "/assets/css/main.css"]);
    config
}

fn online_fetcher(config: &OfflineConfig) -> Arc<ScriptedFetcher> {
    let fetcher = Arc::new(ScriptedFetcher::default());
    for path in config.static_assets.paths() {
        fetcher.route(path, StatusCode::OK, &format!("content of {}", path));
    }
    fetcher
}

async fn harness_with(
    config: OfflineConfig,
    fetcher: Arc<ScriptedFetcher>,
    caches: Arc<RwLock<CacheStorage>>,
) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("luxe_sw=debug")
        .with_test_writer()
        .try_init();

    let forms = FormStore::open(Arc::new(IDBFactory::default()), config.form_db.clone())
        .await
        .unwrap();
    let (manager, events) =
        OfflineCacheManager::new(config, caches.clone(), fetcher.clone(), forms.clone()).unwrap();
    Harness {
        manager,
        events,
        fetcher,
        caches,
        forms,
    }
}

async fn harness() -> Harness {
    let config = small_config();
    let fetcher = online_fetcher(&config);
    harness_with(config, fetcher, Arc::new(RwLock::new(CacheStorage::new()))).await
}

async fn active_harness() -> Harness {
    let h = harness().await;
    h.manager.install().await.unwrap();
    h.manager.activate().await.unwrap();
    h
}

fn drain(events: &mut mpsc::UnboundedReceiver<OfflineEvent>) -> Vec<OfflineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn contact_fields() -> luxe_sw::FormFields {
    match json!({"name": "Jo"}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

// ==================== Install ====================

#[tokio::test]
async fn test_install_populates_static_partition() {
    let h = harness().await;
    assert_eq!(h.manager.install().await.unwrap(), 3);
    assert_eq!(h.manager.state().await, WorkerState::Installed);

    let caches = h.caches.read().await;
    let static_cache = caches.get("static-v1.0.0").unwrap();
    assert_eq!(static_cache.len(), 3);
    for path in ["/", "/index.html", "/assets/css/main.css"] {
        let entry = static_cache
            .match_request(&Request::get(url(path)))
            .unwrap_or_else(|| panic!("{} not cached", path));
        assert_eq!(entry.body, format!("content of {}", path).into_bytes());
    }
}

#[tokio::test]
async fn test_install_full_default_manifest() {
    let config = OfflineConfig::for_origin(Url::parse(ORIGIN).unwrap());
    let fetcher = online_fetcher(&config);
    let h = harness_with(config, fetcher, Arc::new(RwLock::new(CacheStorage::new()))).await;

    assert_eq!(h.manager.install().await.unwrap(), 21);
    assert_eq!(h.caches.read().await.get("static-v1.0.0").unwrap().len(), 21);
}

#[tokio::test]
async fn test_install_failure_leaves_no_static_partition() {
    let mut config = small_config();
    config.static_assets = StaticManifest::new(["/a.html", "/b.css", "/index.html"]);
    let fetcher = online_fetcher(&config);
    fetcher.fail("/b.css");

    let h = harness_with(config, fetcher, Arc::new(RwLock::new(CacheStorage::new()))).await;
    let mut events = h.events;

    assert!(matches!(
        h.manager.install().await,
        Err(luxe_sw::ServiceWorkerError::InstallFailed(_))
    ));
    assert_eq!(h.manager.state().await, WorkerState::Redundant);
    assert!(!h.caches.read().await.has("static-v1.0.0"));
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, OfflineEvent::SkipWaiting { .. })));
}

#[tokio::test]
async fn test_install_failure_with_two_asset_manifest() {
    let mut config = small_config();
    config.static_assets = StaticManifest::new(["/a.html", "/b.css"]);
    config.offline_shell = "/a.html".to_string();
    let fetcher = online_fetcher(&config);
    fetcher.fail("/b.css");

    let h = harness_with(config, fetcher, Arc::new(RwLock::new(CacheStorage::new()))).await;
    assert!(matches!(
        h.manager.install().await,
        Err(luxe_sw::ServiceWorkerError::InstallFailed(_))
    ));
    assert!(!h.caches.read().await.has("static-v1.0.0"));
}

#[tokio::test]
async fn test_install_non_2xx_asset_fails() {
    let config = small_config();
    let fetcher = online_fetcher(&config);
    fetcher.route("/assets/css/main.css", StatusCode::INTERNAL_SERVER_ERROR, "boom");

    let h = harness_with(config, fetcher, Arc::new(RwLock::new(CacheStorage::new()))).await;
    assert!(h.manager.install().await.is_err());
    assert!(!h.caches.read().await.has("static-v1.0.0"));
}

#[tokio::test]
async fn test_failed_install_keeps_previous_partitions() {
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    let first = harness_with(small_config(), online_fetcher(&small_config()), caches.clone()).await;
    first.manager.install().await.unwrap();
    first.manager.activate().await.unwrap();

    let mut next = small_config();
    next.versions = CacheVersions::for_release("v1.1.0");
    let fetcher = online_fetcher(&next);
    fetcher.set_offline(true);
    let second = harness_with(next, fetcher, caches.clone()).await;

    assert!(second.manager.install().await.is_err());
    let caches = caches.read().await;
    assert!(caches.has("static-v1.0.0"));
    assert!(!caches.has("static-v1.1.0"));
}

// ==================== Activate ====================

#[tokio::test]
async fn test_activation_removes_old_partitions() {
    let caches = Arc::new(RwLock::new(CacheStorage::new()));
    {
        let mut storage = caches.write().await;
        storage.open("static-v0.9.0");
        storage.open("dynamic-v0.9.0");
        storage.open("luxe-nightclub-v1.0.0");
    }

    let config = small_config();
    let h = harness_with(config.clone(), online_fetcher(&config), caches).await;
    let mut events = h.events;
    h.manager.install().await.unwrap();
    let removed = h.manager.activate().await.unwrap();
    assert_eq!(removed, 3);

    let storage = h.caches.read().await;
    assert_eq!(storage.keys(), vec!["static-v1.0.0".to_string()]);
    drop(storage);

    let deleted: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OfflineEvent::PartitionDeleted { name } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(deleted.len(), removed);
    assert!(deleted.contains(&"luxe-nightclub-v1.0.0".to_string()));
}

#[tokio::test]
async fn test_activation_keeps_current_partitions() {
    let h = active_harness().await;
    h.fetcher.route("/api/events", StatusCode::OK, "[]");
    h.manager
        .handle_fetch(&Request::get(url("/api/events")))
        .await
        .unwrap();

    // Re-activating with the same versions deletes nothing.
    assert_eq!(h.manager.activate().await.unwrap(), 0);
    let storage = h.caches.read().await;
    assert!(storage.has("static-v1.0.0"));
    assert!(storage.has("dynamic-v1.0.0"));
}

#[tokio::test]
async fn test_activation_claims_clients() {
    let h = harness().await;
    let mut events = h.events;
    {
        let clients = h.manager.clients();
        let mut clients = clients.write().await;
        clients.add(Client::window("home", url("/")));
        clients.add(Client::window("faq", url("/faq.html")));
    }

    h.manager.install().await.unwrap();
    h.manager.activate().await.unwrap();

    let worker_id = h.manager.worker_id().await;
    assert_eq!(h.manager.clients().read().await.controlled_by(worker_id), 2);
    assert!(drain(&mut events).contains(&OfflineEvent::ClientsClaimed { worker_id, count: 2 }));
}

#[tokio::test]
async fn test_lifecycle_event_order() {
    let h = harness().await;
    let mut events = h.events;
    h.manager.install().await.unwrap();
    h.manager.activate().await.unwrap();

    let states: Vec<WorkerState> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            OfflineEvent::StateChange { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            WorkerState::Installing,
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Activated,
        ]
    );
}

// ==================== Fetch ====================

#[tokio::test]
async fn test_navigation_offline_serves_shell() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let served = h
        .manager
        .handle_fetch(&Request::navigate(url("/gallery.html")))
        .await
        .unwrap();
    assert_eq!(served.source, ResponseSource::OfflineShell);
    assert_eq!(served.response.body().as_ref(), b"content of /index.html");
}

#[tokio::test]
async fn test_navigation_prefers_cache() {
    let h = active_harness().await;
    let calls = h.fetcher.calls();

    let served = h
        .manager
        .handle_fetch(&Request::navigate(url("/index.html")))
        .await
        .unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(h.fetcher.calls(), calls);
}

#[tokio::test]
async fn test_navigation_writes_back_200() {
    let h = active_harness().await;
    h.fetcher.route("/faq.html", StatusCode::OK, "faq");

    let first = h
        .manager
        .handle_fetch(&Request::navigate(url("/faq.html")))
        .await
        .unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    h.fetcher.set_offline(true);
    let second = h
        .manager
        .handle_fetch(&Request::navigate(url("/faq.html")))
        .await
        .unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body().as_ref(), b"faq");
}

#[tokio::test]
async fn test_navigation_without_shell_fails() {
    let h = harness().await;
    h.manager.install().await.unwrap();
    h.manager.activate().await.unwrap();
    h.caches.write().await.delete("static-v1.0.0");
    h.fetcher.set_offline(true);

    assert!(h
        .manager
        .handle_fetch(&Request::navigate(url("/about.html")))
        .await
        .is_none());
}

#[tokio::test]
async fn test_navigation_wins_over_manifest() {
    let h = active_harness().await;
    let request = Request::navigate(url("/assets/css/main.css"));
    assert_eq!(h.manager.select_policy(&request), FetchPolicy::Navigation);

    h.caches.write().await.delete("static-v1.0.0");
    h.fetcher.set_offline(true);
    h.caches
        .write()
        .await
        .open("dynamic-v1.0.0")
        .put(
            &Request::get(url("/index.html")),
            &Response::new(StatusCode::OK, "shell"),
        )
        .unwrap();

    // A static asset would fail here; a navigation falls back to the shell.
    let served = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::OfflineShell);
}

#[tokio::test]
async fn test_static_asset_served_from_cache_without_network() {
    let h = active_harness().await;
    let calls = h.fetcher.calls();

    let request = Request::get(url("/assets/css/main.css"));
    assert_eq!(h.manager.select_policy(&request), FetchPolicy::StaticAsset);
    let served = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(h.fetcher.calls(), calls);
}

#[tokio::test]
async fn test_fragment_does_not_defeat_cache_match() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let asset = Request::get(url("/assets/css/main.css#x"));
    let served = h.manager.handle_fetch(&asset).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body().as_ref(), b"content of /assets/css/main.css");

    let page = Request::navigate(url("/index.html#top"));
    let served = h.manager.handle_fetch(&page).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert!(served.is_from_cache());
}

#[tokio::test]
async fn test_static_asset_miss_is_not_written_back() {
    let h = active_harness().await;
    h.caches.write().await.delete("static-v1.0.0");

    let request = Request::get(url("/assets/css/main.css"));
    let served = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(h.caches.read().await.match_request(&request).is_none());

    h.fetcher.set_offline(true);
    assert!(h.manager.handle_fetch(&request).await.is_none());
}

#[tokio::test]
async fn test_generic_second_request_served_from_cache() {
    let h = active_harness().await;
    h.fetcher.route("/api/events", StatusCode::OK, r#"[{"night":"friday"}]"#);
    let request = Request::get(url("/api/events"));

    let first = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    let calls = h.fetcher.calls();

    let second = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body(), first.response.body());
    assert_eq!(h.fetcher.calls(), calls);
}

#[tokio::test]
async fn test_non_200_responses_are_not_cached() {
    let h = active_harness().await;
    h.fetcher.route("/api/missing", StatusCode::NOT_FOUND, "nope");
    h.fetcher.route("/api/empty", StatusCode::NO_CONTENT, "");

    for path in ["/api/missing", "/api/empty"] {
        let request = Request::get(url(path));
        let served = h.manager.handle_fetch(&request).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert!(h.caches.read().await.match_request(&request).is_none());
    }

    let navigation = Request::navigate(url("/gone.html"));
    let served = h.manager.handle_fetch(&navigation).await.unwrap();
    assert_eq!(served.response.status, StatusCode::NOT_FOUND);
    assert!(h.caches.read().await.match_request(&navigation).is_none());
}

#[tokio::test]
async fn test_offline_image_gets_placeholder() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let request = Request::get(url("/assets/images/dj.jpg")).with_destination(RequestDestination::Image);
    let served = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::OfflinePlaceholder);
    assert_eq!(served.response.status, StatusCode::OK);
    assert_eq!(
        served.response.content_type().unwrap().essence_str(),
        "image/svg+xml"
    );
    assert!(served.response.text().unwrap().contains("Offline"));
}

#[tokio::test]
async fn test_offline_generic_non_image_fails() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let request = Request::get(url("/api/events"));
    assert!(h.manager.handle_fetch(&request).await.is_none());
}

#[tokio::test]
async fn test_post_requests_are_never_cached() {
    let h = active_harness().await;
    h.fetcher.route("/api/contact", StatusCode::OK, "ok");

    let request = Request::post_json(url("/api/contact"), &json!({"name": "Jo"})).unwrap();
    let served = h.manager.handle_fetch(&request).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert!(!h.caches.read().await.has("dynamic-v1.0.0"));
}

// ==================== Background sync ====================

#[tokio::test]
async fn test_sync_delivers_pending_contact_form() {
    let h = active_harness().await;
    h.fetcher.route("/api/contact", StatusCode::OK, "thanks");
    h.forms
        .save_pending(SyncTag::ContactForm, contact_fields())
        .await
        .unwrap();

    assert_eq!(h.manager.handle_sync("contact-form").await, SyncOutcome::Delivered);
    assert_eq!(h.forms.pending(SyncTag::ContactForm).await.unwrap(), None);

    let posts = h.fetcher.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "/api/contact");
    let body: serde_json::Value = serde_json::from_slice(&posts[0].1).unwrap();
    assert_eq!(body, json!({"name": "Jo"}));
}

#[tokio::test]
async fn test_sync_failure_keeps_record() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);
    h.forms
        .save_pending(SyncTag::ContactForm, contact_fields())
        .await
        .unwrap();

    assert!(matches!(
        h.manager.handle_sync("contact-form").await,
        SyncOutcome::Failed { .. }
    ));
    assert_eq!(
        h.forms.pending(SyncTag::ContactForm).await.unwrap(),
        Some(contact_fields())
    );
}

#[tokio::test]
async fn test_sync_server_error_keeps_record() {
    let h = active_harness().await;
    h.fetcher.route("/api/reservation", StatusCode::SERVICE_UNAVAILABLE, "later");
    h.forms
        .save_pending(SyncTag::ReservationForm, contact_fields())
        .await
        .unwrap();

    assert!(matches!(
        h.manager.handle_sync("reservation-form").await,
        SyncOutcome::Failed { .. }
    ));
    assert!(h.forms.pending(SyncTag::ReservationForm).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sync_nothing_pending_makes_no_request() {
    let h = active_harness().await;
    let calls = h.fetcher.calls();

    assert_eq!(
        h.manager.handle_sync("reservation-form").await,
        SyncOutcome::NothingPending
    );
    assert_eq!(h.fetcher.calls(), calls);
}

#[tokio::test]
async fn test_sync_unknown_tag() {
    let h = active_harness().await;
    assert_eq!(
        h.manager.handle_sync("newsletter").await,
        SyncOutcome::UnknownTag("newsletter".to_string())
    );
}

#[tokio::test]
async fn test_sync_all_reports_each_tag() {
    let h = active_harness().await;
    let mut events = h.events;
    h.fetcher.route("/api/contact", StatusCode::OK, "thanks");
    h.forms
        .save_pending(SyncTag::ContactForm, contact_fields())
        .await
        .unwrap();
    drain(&mut events);

    let outcomes = h.manager.sync_all().await;
    assert_eq!(
        outcomes,
        vec![
            (SyncTag::ContactForm, SyncOutcome::Delivered),
            (SyncTag::ReservationForm, SyncOutcome::NothingPending),
        ]
    );

    let completed = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, OfflineEvent::SyncCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
}
