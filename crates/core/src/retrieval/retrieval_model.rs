use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cid::Cid;
use crate::deals::OutcomeFilter;

/// Wire protocols a provider can advertise for retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Bitswap,
    GraphsyncFilecoinV1,
    Http,
}

/// One provider record returned by the content indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalCandidate {
    /// Identifier the record was published for.
    pub root: Cid,
    pub peer_id: String,
    pub addrs: Vec<String>,
    /// Opaque transport metadata, see [`parse_transport_metadata`](super::parse_transport_metadata).
    pub metadata: Vec<u8>,
}

/// Fully resolved single-block fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub root: Cid,
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub protocols: Vec<TransportProtocol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub bytes: u64,
    pub duration: Duration,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlock {
    pub bytes: Vec<u8>,
    pub stats: FetchStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("retrieval cancelled")]
    Cancelled,
    /// The message is classified into a recorded outcome.
    #[error("{0}")]
    Failed(String),
}

impl FetchError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// How retrieval candidates are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStrategy {
    /// Ask the content indexer and keep the record matching the provider.
    #[default]
    Indexer,
    /// Dial the provider's configured endpoints directly.
    Direct,
}

/// Which providers a cycle covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderScope {
    Explicit(Vec<String>),
    /// Configured providers, or every known provider when none are configured.
    Configured,
    /// Every provider present in the registry.
    Known,
}

/// On-demand retrieval request. Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveRequest {
    pub providers: Option<Vec<String>>,
    pub limit: Option<i64>,
    pub parallel: Option<usize>,
    pub result: Option<OutcomeFilter>,
    pub post: Option<bool>,
}

/// Counts for one retrieval cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub selected: usize,
    /// Outcome label -> number of deals.
    pub outcomes: BTreeMap<String, usize>,
    pub cancelled: usize,
    pub not_started: usize,
    pub persist_failures: usize,
    pub forwarded: usize,
}
