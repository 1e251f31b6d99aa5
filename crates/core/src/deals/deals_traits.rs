use async_trait::async_trait;

use super::deals_model::{Deal, DealListQuery, NewDeal, PendingDealQuery, RetrievalOutcome};
use crate::Result;

/// Durable store of every tracked deal and its latest retrieval outcome.
///
/// Reads may run concurrently. Writes are serialized by the implementation.
#[async_trait]
pub trait DealRepositoryTrait: Send + Sync {
    /// Inserts the deal unless a row with the same `deal_id` exists.
    /// Returns `true` when a row was written. Duplicates are not errors.
    async fn insert_if_absent(&self, deal: NewDeal) -> Result<bool>;

    /// Deals eligible for a retrieval attempt, per provider.
    fn select_pending(&self, query: &PendingDealQuery) -> Result<Vec<Deal>>;

    /// Every distinct provider that owns at least one deal.
    fn select_distinct_providers(&self) -> Result<Vec<String>>;

    /// Overwrites the outcome columns of one deal.
    async fn update_outcome(&self, deal_id: i64, outcome: RetrievalOutcome) -> Result<()>;

    fn get_deal(&self, deal_id: i64) -> Result<Option<Deal>>;

    /// Deals that have been attempted at least once, newest attempt first.
    fn list_checked(&self, query: &DealListQuery) -> Result<Vec<Deal>>;
}
