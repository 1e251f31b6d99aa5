use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::chain_model::{ActorEvent, ActorEventFilter, DealProposal};
use crate::Result;

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Opens a stream of actor events matching `filter`.
    ///
    /// The receiver closes when the underlying subscription drops or `cancel`
    /// fires. Callers resubscribe after a close.
    async fn subscribe_actor_events(
        &self,
        filter: ActorEventFilter,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ActorEvent>>;

    /// Authoritative deal proposal as recorded by the storage market actor.
    async fn query_deal_state(&self, deal_id: i64) -> Result<DealProposal>;

    /// Network peer identity registered for a provider, if any.
    async fn query_provider_identity(&self, provider: &str) -> Result<Option<String>>;
}
