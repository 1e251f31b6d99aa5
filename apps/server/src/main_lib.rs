//! Process settings, service wiring and background tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dealbot_core::backfill::BackfillService;
use dealbot_core::car::{ContainerFetchService, ObjectStore};
use dealbot_core::chain::ChainClient;
use dealbot_core::config::{BotConfig, ObjectStoreConfig};
use dealbot_core::deals::DealRepositoryTrait;
use dealbot_core::onchain::OnChainListener;
use dealbot_core::retrieval::{BlockSink, RetrievalService};
use dealbot_network::{
    FsObjectStore, HttpBlockSink, HttpObjectStore, HttpRetrievalClient, IpniIndexerClient,
    LotusClient,
};
use dealbot_storage_sqlite::{db, DealRepository};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5678";
const REPO_DIR_NAME: &str = ".dealbot";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub repo: PathBuf,
    pub listen: String,
    pub debug: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let repo = std::env::var("DEALBOT_REPO")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_repo);
        let listen = std::env::var("DEALBOT_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let debug = std::env::var("DEALBOT_DEBUG")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            repo,
            listen,
            debug,
        }
    }
}

fn default_repo() -> PathBuf {
    std::env::var("HOME")
        .map(|home| Path::new(&home).join(REPO_DIR_NAME))
        .unwrap_or_else(|_| PathBuf::from(REPO_DIR_NAME))
}

/// `RUST_LOG` wins; otherwise `debug` or `info`. `log` records from the
/// library crates are bridged into tracing.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        warn!("Tracing subscriber already installed");
    }
}

pub struct AppState {
    pub config: BotConfig,
    pub repository: Arc<dyn DealRepositoryTrait>,
    pub retrieval: RetrievalService,
    pub listener: Arc<OnChainListener>,
    /// Present when a deal snapshot is configured.
    pub backfill: Option<Arc<BackfillService>>,
    /// Present when both an object store and a sink are configured.
    pub containers: Option<ContainerFetchService>,
    pub cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Opens the registry under `repo` and builds every service from `config`.
    pub fn build(config: BotConfig, repo: &Path) -> anyhow::Result<Arc<Self>> {
        let db_path = db::init(&repo.to_string_lossy())?;
        db::run_migrations(&db_path)?;
        let pool = db::create_pool(&db_path)?;
        let writer = db::spawn_writer(pool.as_ref().clone());
        let repository: Arc<dyn DealRepositoryTrait> = Arc::new(DealRepository::new(pool, writer));

        let chain: Arc<dyn ChainClient> = Arc::new(
            LotusClient::new(
                config.lotus.clone(),
                Duration::from_secs(config.event_poll_secs),
            )
            .context("building lotus client")?,
        );
        let indexer = Arc::new(IpniIndexerClient::new(&config.indexer_url)?);
        let retrieval_client = Arc::new(HttpRetrievalClient::new(Duration::from_secs(
            config.retrieval_timeout_secs,
        ))?);

        let sink: Option<Arc<dyn BlockSink>> = match config.sink_addr.as_deref() {
            Some(addr) => Some(Arc::new(HttpBlockSink::new(addr)?)),
            None => None,
        };
        let store: Option<Arc<dyn ObjectStore>> = match &config.object_store {
            Some(ObjectStoreConfig::Http { base_url }) => {
                Some(Arc::new(HttpObjectStore::new(base_url)?))
            }
            Some(ObjectStoreConfig::Fs { root }) => Some(Arc::new(FsObjectStore::new(root.clone()))),
            None => None,
        };

        let retrieval = RetrievalService::new(
            repository.clone(),
            chain.clone(),
            indexer,
            retrieval_client,
            sink.clone(),
            config.retrieval_settings(),
        );
        let listener = Arc::new(OnChainListener::new(
            chain,
            repository.clone(),
            config.listener_config(),
        )?);
        let backfill = config.deal_snapshot.clone().map(|path| {
            Arc::new(BackfillService::new(
                repository.clone(),
                path,
                config.configured_providers(),
            ))
        });
        let containers = match (store, sink) {
            (Some(store), Some(sink)) => Some(ContainerFetchService::new(store, sink)),
            _ => None,
        };

        Ok(Arc::new(Self {
            config,
            repository,
            retrieval,
            listener,
            backfill,
            containers,
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Starts the on-chain listener and the periodic retrieval scheduler.
    pub async fn start_background(&self) {
        let mut guard = self.background.lock().await;
        if !guard.is_empty() {
            return;
        }

        let listener = self.listener.clone();
        let cancel = self.cancel.child_token();
        guard.push(tokio::spawn(async move {
            if let Err(err) = listener.run(cancel).await {
                if !err.is_cancelled() {
                    error!("[OnChain] Listener stopped: {}", err);
                }
            }
        }));

        let retrieval = self.retrieval.clone();
        let cancel = self.cancel.child_token();
        guard.push(tokio::spawn(async move {
            retrieval.run_periodic(cancel).await;
        }));
        info!("Background tasks started");
    }

    /// Cancels all work and waits briefly for background tasks to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Background task did not stop in time; aborting");
                handle.abort();
            }
        }
        info!("Shutdown complete");
    }
}
