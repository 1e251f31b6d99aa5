use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::retrieval_model::{FetchError, FetchRequest, FetchedBlock, RetrievalCandidate};
use crate::cid::Cid;
use crate::Result;

/// Content routing lookup.
#[async_trait]
pub trait IndexerClient: Send + Sync {
    /// Every provider record the indexer holds for `root`. An unknown root is
    /// an empty list, not an error.
    async fn find_candidates(&self, root: &Cid) -> Result<Vec<RetrievalCandidate>>;
}

/// Fetches a single block from one provider.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    /// Must return promptly with [`FetchError::Cancelled`] once `cancel` fires.
    async fn fetch_block(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<FetchedBlock, FetchError>;
}

/// Downstream consumer of verified blocks.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn submit(&self, root: &Cid, block: &[u8]) -> Result<()>;
}
