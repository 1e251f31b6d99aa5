//! In-memory fakes of the capability traits for service tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::car::{ObjectStore, ObjectStream};
use crate::chain::{ActorEvent, ActorEventFilter, ChainClient, DealProposal};
use crate::cid::Cid;
use crate::deals::{
    Deal, DealListQuery, DealRepositoryTrait, NewDeal, OutcomeFilter,
    PendingDealQuery, PendingFilter, RetrievalOutcome, DEAL_LIST_PAGE_SIZE,
};
use crate::errors::{Error, Result};
use crate::retrieval::{
    BlockSink, FetchError, FetchRequest, FetchStats, FetchedBlock, IndexerClient,
    RetrievalCandidate, RetrievalClient,
};

#[derive(Default)]
pub struct MemoryDealRepository {
    deals: Mutex<BTreeMap<i64, Deal>>,
}

impl MemoryDealRepository {
    pub fn deal(&self, deal_id: i64) -> Option<Deal> {
        self.deals.lock().unwrap().get(&deal_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.deals.lock().unwrap().len()
    }
}

#[async_trait]
impl DealRepositoryTrait for MemoryDealRepository {
    async fn insert_if_absent(&self, deal: NewDeal) -> Result<bool> {
        let mut deals = self.deals.lock().unwrap();
        if deals.contains_key(&deal.deal_id) {
            return Ok(false);
        }
        deals.insert(
            deal.deal_id,
            Deal {
                deal_id: deal.deal_id,
                payload_cid: deal.payload_cid,
                client: deal.client,
                provider: deal.provider,
                start_epoch: deal.start_epoch,
                end_epoch: deal.end_epoch,
                indexer_result: None,
                fetch_result: None,
                err_msg: None,
                last_update: None,
            },
        );
        Ok(true)
    }

    fn select_pending(&self, query: &PendingDealQuery) -> Result<Vec<Deal>> {
        let day_start = query.as_of.date_naive().and_time(NaiveTime::MIN).and_utc();
        let deals = self.deals.lock().unwrap();
        let mut selected = Vec::new();
        for provider in &query.providers {
            let matching = deals
                .values()
                .filter(|d| &d.provider == provider)
                .filter(|d| match query.filter {
                    PendingFilter::Due => d.last_update.map_or(true, |t| t < day_start),
                    PendingFilter::Outcome(OutcomeFilter::Fetch(f)) => d.fetch_result == Some(f),
                    PendingFilter::Outcome(OutcomeFilter::Indexer(i)) => {
                        d.indexer_result == Some(i)
                    }
                })
                .take(query.limit.map_or(usize::MAX, |l| l as usize))
                .cloned();
            selected.extend(matching);
        }
        Ok(selected)
    }

    fn select_distinct_providers(&self) -> Result<Vec<String>> {
        let deals = self.deals.lock().unwrap();
        let mut providers: Vec<String> = deals.values().map(|d| d.provider.clone()).collect();
        providers.sort();
        providers.dedup();
        Ok(providers)
    }

    async fn update_outcome(&self, deal_id: i64, outcome: RetrievalOutcome) -> Result<()> {
        let mut deals = self.deals.lock().unwrap();
        let deal = deals
            .get_mut(&deal_id)
            .ok_or_else(|| Error::invalid_input(format!("unknown deal {deal_id}")))?;
        deal.indexer_result = outcome.indexer_result;
        deal.fetch_result = outcome.fetch_result;
        deal.err_msg = outcome.err_msg;
        deal.last_update = Some(outcome.checked_at);
        Ok(())
    }

    fn get_deal(&self, deal_id: i64) -> Result<Option<Deal>> {
        Ok(self.deal(deal_id))
    }

    fn list_checked(&self, query: &DealListQuery) -> Result<Vec<Deal>> {
        let deals = self.deals.lock().unwrap();
        let mut checked: Vec<Deal> = deals
            .values()
            .filter(|d| d.last_update.is_some())
            .cloned()
            .collect();
        checked.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        Ok(checked
            .into_iter()
            .skip(query.offset() as usize)
            .take(DEAL_LIST_PAGE_SIZE as usize)
            .collect())
    }
}

/// Chain fake with canned deal states, identities and subscriptions.
#[derive(Default)]
pub struct StaticChain {
    deals: Mutex<HashMap<i64, DealProposal>>,
    identities: Mutex<HashMap<String, String>>,
    subscriptions: Mutex<VecDeque<Result<Vec<ActorEvent>>>>,
    subscribe_calls: AtomicUsize,
    deal_queries: AtomicUsize,
}

impl StaticChain {
    pub fn set_deal(&self, deal_id: i64, proposal: DealProposal) {
        self.deals.lock().unwrap().insert(deal_id, proposal);
    }

    pub fn set_identity(&self, provider: &str, peer_id: &str) {
        self.identities
            .lock()
            .unwrap()
            .insert(provider.to_string(), peer_id.to_string());
    }

    /// Queues the result of the next subscription. `Ok` streams the events
    /// and then closes.
    pub fn push_subscription(&self, result: Result<Vec<ActorEvent>>) {
        self.subscriptions.lock().unwrap().push_back(result);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn deal_query_count(&self) -> usize {
        self.deal_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for StaticChain {
    async fn subscribe_actor_events(
        &self,
        _filter: ActorEventFilter,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ActorEvent>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.subscriptions.lock().unwrap().pop_front();
        let events = next.unwrap_or_else(|| Err(Error::chain("no subscription available")))?;
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).unwrap();
        }
        Ok(rx)
    }

    async fn query_deal_state(&self, deal_id: i64) -> Result<DealProposal> {
        self.deal_queries.fetch_add(1, Ordering::SeqCst);
        self.deals
            .lock()
            .unwrap()
            .get(&deal_id)
            .cloned()
            .ok_or_else(|| Error::chain(format!("deal {deal_id} not found")))
    }

    async fn query_provider_identity(&self, provider: &str) -> Result<Option<String>> {
        Ok(self.identities.lock().unwrap().get(provider).cloned())
    }
}

#[derive(Default)]
pub struct StaticIndexer {
    candidates: Mutex<Vec<RetrievalCandidate>>,
    pub lookups: AtomicUsize,
}

impl StaticIndexer {
    pub fn add(&self, candidate: RetrievalCandidate) {
        self.candidates.lock().unwrap().push(candidate);
    }
}

#[async_trait]
impl IndexerClient for StaticIndexer {
    async fn find_candidates(&self, root: &Cid) -> Result<Vec<RetrievalCandidate>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        // mimic a multihash lookup: records for any codec with the same hash
        Ok(self
            .candidates
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.root.hash() == root.hash())
            .cloned()
            .collect())
    }
}

/// Retrieval fake returning one canned response, tracking concurrency.
#[derive(Default)]
pub struct ScriptedRetrieval {
    response: Mutex<Option<std::result::Result<Vec<u8>, FetchError>>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    pub calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedRetrieval {
    pub fn respond_with(&self, response: std::result::Result<Vec<u8>, FetchError>) {
        *self.response.lock().unwrap() = Some(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl RetrievalClient for ScriptedRetrieval {
    async fn fetch_block(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<FetchedBlock, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        let finished = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !finished {
            return Err(FetchError::Cancelled);
        }

        let response = self
            .response
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(FetchError::failed("no scripted response")));
        response.map(|bytes| FetchedBlock {
            stats: FetchStats {
                bytes: bytes.len() as u64,
                duration: delay,
                endpoint: request.addrs.first().cloned().unwrap_or_default(),
            },
            bytes,
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    submitted: Mutex<Vec<(Cid, Vec<u8>)>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            submitted: Mutex::default(),
            fail: true,
        }
    }

    pub fn submitted(&self) -> Vec<(Cid, Vec<u8>)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockSink for RecordingSink {
    async fn submit(&self, root: &Cid, block: &[u8]) -> Result<()> {
        if self.fail {
            return Err(Error::sink("downstream unavailable"));
        }
        self.submitted
            .lock()
            .unwrap()
            .push((root.clone(), block.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download_stream(&self, key: &str) -> Result<ObjectStream> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::object_store(format!("no object '{key}'")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}
