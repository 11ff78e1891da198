//! Command line driver for the Luxe offline cache manager.
//!
//! Provides commands for:
//! - Printing the effective worker configuration
//! - Installing and activating a worker against a live origin
//! - Replaying fetches through the cache policies
//! - Queuing and syncing deferred form submissions
//!
//! ## Usage
//!
//! ```bash
//! # Pre-cache the static manifest and persist the partitions
//! luxe-offline --config luxe.json install
//!
//! # Serve a navigation the way the worker would
//! luxe-offline fetch https://luxe.example/gallery.html --navigate
//!
//! # Queue a contact form, then deliver everything pending
//! luxe-offline queue contact-form '{"name": "Jo"}'
//! luxe-offline sync
//! ```

use clap::{Parser, Subcommand};
use luxe_common::{init_logging, LogConfig, LogFormat, LuxeError};
use luxe_idb::IDBFactory;
use luxe_net::{HttpFetcher, LoaderConfig, Request, RequestDestination};
use luxe_sw::{
    CacheStorage, FormStore, OfflineCacheManager, OfflineConfig, OfflineEvent, ServiceWorkerError,
    SyncOutcome, SyncTag,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "luxe-offline")]
#[command(about = "Offline asset cache manager for the Luxe site")]
struct Cli {
    /// Worker configuration file (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache partition snapshot
    #[arg(long, global = true, default_value = "luxe-caches.json")]
    caches: PathBuf,

    /// Pending form database snapshot
    #[arg(long, global = true, default_value = "luxe-forms.json")]
    forms: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,

    /// Fetch the static manifest, activate, and persist the partitions
    Install,

    /// Run one request through the fetch policies
    Fetch {
        /// Absolute URL to request
        url: Url,
        /// Treat the request as a top-level navigation
        #[arg(long)]
        navigate: bool,
        /// Mark the request as an image load
        #[arg(long, conflicts_with = "navigate")]
        image: bool,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// Deliver pending submissions (every tag when none is given)
    Sync {
        /// Sync tag, e.g. contact-form
        tag: Option<String>,
    },

    /// Store a form submission for later delivery
    Queue {
        /// Sync tag, e.g. reservation-form
        tag: String,
        /// Form fields as a JSON object
        fields: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), LuxeError> {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(format));

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", config.to_json()?);
        }

        Commands::Install => {
            let caches = Arc::new(RwLock::new(CacheStorage::load_from(&cli.caches)?));
            let factory = open_forms(&cli.forms).await?;
            let manager = build_manager(config, caches.clone(), factory).await?;

            let installed = manager.install().await?;
            let deleted = manager.activate().await?;

            caches.read().await.save_to(&cli.caches)?;

            println!("Install result:");
            println!("  Cached assets:      {}", installed);
            println!("  Deleted partitions: {}", deleted);
            println!("  Partitions:         {}", caches.read().await.keys().join(", "));
            println!("Caches written to: {}", cli.caches.display());
        }

        Commands::Fetch {
            url,
            navigate,
            image,
            body,
        } => {
            let caches = Arc::new(RwLock::new(CacheStorage::load_from(&cli.caches)?));
            let factory = open_forms(&cli.forms).await?;
            let manager = build_manager(config, caches.clone(), factory).await?;

            if let Err(e) = manager.resume().await {
                warn!(error = %e, "No installed worker; requests go straight to the network");
            }

            let request = if navigate {
                Request::navigate(url)
            } else if image {
                Request::get(url).with_destination(RequestDestination::Image)
            } else {
                let destination = RequestDestination::from_path(url.path());
                Request::get(url).with_destination(destination)
            };

            println!("Policy: {}", manager.select_policy(&request).as_str());
            match manager.handle_fetch(&request).await {
                Some(served) => {
                    println!("Source: {:?}", served.source);
                    println!("Cached: {}", served.is_from_cache());
                    println!("Status: {}", served.response.status);
                    if body {
                        println!();
                        println!("{}", String::from_utf8_lossy(served.response.body()));
                    }
                    caches.read().await.save_to(&cli.caches)?;
                }
                None => {
                    println!("Network error: no cached or fallback response");
                    std::process::exit(1);
                }
            }
        }

        Commands::Sync { tag } => {
            let caches = Arc::new(RwLock::new(CacheStorage::new()));
            let factory = open_forms(&cli.forms).await?;
            let manager = build_manager(config, caches, factory.clone()).await?;

            let outcomes = match tag {
                Some(tag) => vec![(tag.clone(), manager.handle_sync(&tag).await)],
                None => manager
                    .sync_all()
                    .await
                    .into_iter()
                    .map(|(tag, outcome)| (tag.to_string(), outcome))
                    .collect(),
            };

            factory
                .save_to(&cli.forms)
                .await
                .map_err(ServiceWorkerError::from)?;

            let mut failed = 0;
            for (tag, outcome) in &outcomes {
                if matches!(outcome, SyncOutcome::Failed { .. } | SyncOutcome::UnknownTag(_)) {
                    failed += 1;
                }
                println!("{:<18} {:?}", tag, outcome);
            }
            if failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::Queue { tag, fields } => {
            let tag: SyncTag = tag.parse()?;
            let fields = match serde_json::from_str(&fields) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    return Err(LuxeError::InvalidArgument(
                        "form fields must be a JSON object".to_string(),
                    ))
                }
                Err(e) => return Err(LuxeError::config_with_source("invalid form fields", e)),
            };

            let factory = open_forms(&cli.forms).await?;
            let forms = FormStore::open(factory.clone(), config.form_db.clone()).await?;
            forms.save_pending(tag, fields).await?;
            factory
                .save_to(&cli.forms)
                .await
                .map_err(ServiceWorkerError::from)?;

            println!("Queued {} in {}", tag, cli.forms.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<OfflineConfig, ServiceWorkerError> {
    match path {
        Some(path) => OfflineConfig::load(path),
        None => Ok(OfflineConfig::default()),
    }
}

async fn open_forms(path: &Path) -> Result<Arc<IDBFactory>, ServiceWorkerError> {
    let factory = IDBFactory::default();
    factory.load_from(path).await?;
    Ok(Arc::new(factory))
}

async fn build_manager(
    config: OfflineConfig,
    caches: Arc<RwLock<CacheStorage>>,
    factory: Arc<IDBFactory>,
) -> Result<OfflineCacheManager, ServiceWorkerError> {
    let fetcher = HttpFetcher::new(LoaderConfig::default())?;
    let forms = FormStore::open(factory, config.form_db.clone()).await?;
    let (manager, events) = OfflineCacheManager::new(config, caches, Arc::new(fetcher), forms)?;
    tokio::spawn(log_events(events));
    Ok(manager)
}

async fn log_events(mut events: mpsc::UnboundedReceiver<OfflineEvent>) {
    while let Some(event) = events.recv().await {
        debug!(?event, "Worker event");
    }
}
