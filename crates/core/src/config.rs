//! Repository configuration (`config.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::chain::parse_id_address;
use crate::errors::{Error, Result};
use crate::onchain::ListenerConfig;
use crate::retrieval::{CandidateStrategy, RetrievalSettings};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_LOTUS_URL: &str = "https://api.node.glif.io/rpc/v1";
pub const DEFAULT_INDEXER_URL: &str = "https://cid.contact";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotusEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    Http {
        #[serde(rename = "baseUrl")]
        base_url: String,
    },
    Fs {
        root: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotConfig {
    /// Chain node endpoints, tried in order.
    pub lotus: Vec<LotusEndpoint>,
    /// Provider ID address -> multiaddrs for direct retrieval.
    pub providers: BTreeMap<String, Vec<String>>,
    pub network_prefix: String,
    pub interval_secs: u64,
    pub parallel: usize,
    /// Per-provider cap for periodic cycles. 0 = uncapped.
    pub limit: i64,
    pub candidate_strategy: CandidateStrategy,
    pub indexer_url: String,
    pub retrieval_timeout_secs: u64,
    /// `host:port` of the downstream block sink.
    pub sink_addr: Option<String>,
    /// Forward verified blocks from periodic cycles.
    pub post: bool,
    pub deal_snapshot: Option<PathBuf>,
    pub object_store: Option<ObjectStoreConfig>,
    pub resubscribe_delay_secs: u64,
    pub event_poll_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            lotus: vec![LotusEndpoint {
                url: DEFAULT_LOTUS_URL.to_string(),
                token: None,
            }],
            providers: BTreeMap::new(),
            network_prefix: "f".to_string(),
            interval_secs: 60,
            parallel: 10,
            limit: 100,
            candidate_strategy: CandidateStrategy::Indexer,
            indexer_url: DEFAULT_INDEXER_URL.to_string(),
            retrieval_timeout_secs: 30,
            sink_addr: None,
            post: false,
            deal_snapshot: None,
            object_store: None,
            resubscribe_delay_secs: 10,
            event_poll_secs: 30,
        }
    }
}

impl BotConfig {
    pub fn path(repo: &Path) -> PathBuf {
        repo.join(CONFIG_FILE_NAME)
    }

    pub fn load(repo: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(Self::path(repo))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates the repository with a default config when missing. An existing
    /// config is loaded, never overwritten.
    pub fn init_repo(repo: &Path) -> Result<Self> {
        std::fs::create_dir_all(repo)?;
        let path = Self::path(repo);
        if path.exists() {
            return Self::load(repo);
        }
        let config = Self::default();
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        info!("Initialised repository at {}", repo.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lotus.is_empty() {
            return Err(Error::config("at least one lotus endpoint is required"));
        }
        if self.parallel == 0 {
            return Err(Error::config("parallel must be at least 1"));
        }
        if !matches!(self.network_prefix.as_str(), "f" | "t") {
            return Err(Error::config(format!(
                "network prefix must be 'f' or 't', got '{}'",
                self.network_prefix
            )));
        }
        for provider in self.providers.keys() {
            parse_id_address(provider)
                .map_err(|_| Error::config(format!("invalid provider address '{provider}'")))?;
        }
        Ok(())
    }

    pub fn configured_providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            providers: self.configured_providers(),
            network_prefix: self.network_prefix.clone(),
            resubscribe_delay: Duration::from_secs(self.resubscribe_delay_secs),
        }
    }

    pub fn retrieval_settings(&self) -> RetrievalSettings {
        RetrievalSettings {
            parallel: self.parallel,
            limit: Some(self.limit).filter(|l| *l > 0),
            interval: Duration::from_secs(self.interval_secs),
            strategy: self.candidate_strategy,
            providers: self.configured_providers(),
            direct_endpoints: self
                .providers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            forward_verified: self.post,
        }
    }
}
