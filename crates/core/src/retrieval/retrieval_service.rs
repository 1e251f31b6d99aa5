use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::classify::classify_fetch_error;
use super::retrieval_model::{
    CandidateStrategy, CycleSummary, FetchError, FetchRequest, ProviderScope,
    RetrievalCandidate, RetrieveRequest,
};
use super::retrieval_traits::{BlockSink, IndexerClient, RetrievalClient};
use super::transport::{http_metadata, parse_transport_metadata, select_candidate};
use crate::chain::ChainClient;
use crate::cid::{verify, Cid};
use crate::deals::{
    Deal, DealRepositoryTrait, FetchResult, IndexerResult, PendingDealQuery, PendingFilter,
    RetrievalOutcome,
};
use crate::errors::{Error, Result};

pub const DEFAULT_PARALLEL: usize = 10;
pub const DEFAULT_LIMIT: i64 = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub parallel: usize,
    /// Per-provider cap for periodic cycles.
    pub limit: Option<i64>,
    pub interval: Duration,
    pub strategy: CandidateStrategy,
    /// Configured provider set.
    pub providers: Vec<String>,
    /// Provider -> multiaddrs, used by [`CandidateStrategy::Direct`].
    pub direct_endpoints: HashMap<String, Vec<String>>,
    /// Forward verified blocks from periodic cycles.
    pub forward_verified: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            limit: Some(DEFAULT_LIMIT),
            interval: DEFAULT_INTERVAL,
            strategy: CandidateStrategy::default(),
            providers: Vec::new(),
            direct_endpoints: HashMap::new(),
            forward_verified: false,
        }
    }
}

/// Resolved parameters for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub scope: ProviderScope,
    pub limit: Option<i64>,
    pub parallel: usize,
    pub filter: PendingFilter,
    pub forward: bool,
}

struct Evaluation {
    outcome: RetrievalOutcome,
    verified: Option<(Cid, Vec<u8>)>,
}

impl Evaluation {
    fn failed(indexer: Option<IndexerResult>, fetch: FetchResult, message: impl Into<String>) -> Self {
        Self {
            outcome: RetrievalOutcome::failed(indexer, fetch, message),
            verified: None,
        }
    }
}

enum TaskReport {
    Cancelled,
    Completed {
        label: &'static str,
        persisted: bool,
        forwarded: bool,
    },
}

/// Schedules retrieval checks over the registry with a bounded worker pool.
#[derive(Clone)]
pub struct RetrievalService {
    repository: Arc<dyn DealRepositoryTrait>,
    chain: Arc<dyn ChainClient>,
    indexer: Arc<dyn IndexerClient>,
    retrieval: Arc<dyn RetrievalClient>,
    sink: Option<Arc<dyn BlockSink>>,
    settings: Arc<RetrievalSettings>,
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

impl RetrievalService {
    pub fn new(
        repository: Arc<dyn DealRepositoryTrait>,
        chain: Arc<dyn ChainClient>,
        indexer: Arc<dyn IndexerClient>,
        retrieval: Arc<dyn RetrievalClient>,
        sink: Option<Arc<dyn BlockSink>>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            repository,
            chain,
            indexer,
            retrieval,
            sink,
            settings: Arc::new(settings),
        }
    }

    pub fn periodic_plan(&self) -> CyclePlan {
        CyclePlan {
            scope: ProviderScope::Configured,
            limit: self.settings.limit,
            parallel: self.settings.parallel,
            filter: PendingFilter::Due,
            forward: self.settings.forward_verified,
        }
    }

    pub fn manual_plan(&self, request: RetrieveRequest) -> CyclePlan {
        let scope = match request.providers {
            Some(providers) if !providers.is_empty() => ProviderScope::Explicit(providers),
            _ => ProviderScope::Known,
        };
        CyclePlan {
            scope,
            limit: request.limit.or(self.settings.limit),
            parallel: request.parallel.unwrap_or(self.settings.parallel),
            filter: request
                .result
                .map(PendingFilter::Outcome)
                .unwrap_or(PendingFilter::Due),
            forward: request.post.unwrap_or(false),
        }
    }

    /// On-demand cycle.
    pub async fn retrieve(
        &self,
        request: RetrieveRequest,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary> {
        self.run_cycle(self.manual_plan(request), cancel).await
    }

    fn resolve_providers(&self, scope: &ProviderScope) -> Result<Vec<String>> {
        let providers = match scope {
            ProviderScope::Explicit(list) if !list.is_empty() => list.clone(),
            ProviderScope::Configured if !self.settings.providers.is_empty() => {
                self.settings.providers.clone()
            }
            _ => self.repository.select_distinct_providers()?,
        };
        let mut seen = HashSet::new();
        Ok(providers
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect())
    }

    /// Selects pending deals and attempts each at most once, with at most
    /// `plan.parallel` attempts in flight.
    pub async fn run_cycle(
        &self,
        plan: CyclePlan,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary> {
        let providers = self.resolve_providers(&plan.scope)?;
        if providers.is_empty() {
            info!("[Retrieve] No providers to check");
            return Ok(CycleSummary::default());
        }

        let query = PendingDealQuery::new(providers, plan.limit, plan.filter);
        let mut seen = HashSet::new();
        let deals: Vec<Deal> = self
            .repository
            .select_pending(&query)?
            .into_iter()
            .filter(|deal| seen.insert(deal.deal_id))
            .collect();

        let mut summary = CycleSummary {
            selected: deals.len(),
            ..Default::default()
        };
        info!(
            "[Retrieve] Cycle over {} provider(s): {} deal(s), parallel={}",
            query.providers.len(),
            deals.len(),
            plan.parallel
        );

        let semaphore = Arc::new(Semaphore::new(plan.parallel.max(1)));
        let mut tasks = JoinSet::new();
        let mut started = 0usize;

        for deal in deals {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| Error::retrieval(format!("worker pool closed: {e}")))?,
            };
            started += 1;
            let service = self.clone();
            let cancel = cancel.clone();
            let forward = plan.forward;
            tasks.spawn(async move {
                let _permit = permit;
                service.attempt(deal, forward, cancel).await
            });
        }
        summary.not_started = summary.selected - started;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskReport::Cancelled) => summary.cancelled += 1,
                Ok(TaskReport::Completed {
                    label,
                    persisted,
                    forwarded,
                }) => {
                    *summary.outcomes.entry(label.to_string()).or_default() += 1;
                    if !persisted {
                        summary.persist_failures += 1;
                    }
                    if forwarded {
                        summary.forwarded += 1;
                    }
                }
                Err(e) => error!("[Retrieve] Retrieval task aborted: {}", e),
            }
        }

        info!(
            "[Retrieve] Cycle done: {:?} cancelled={} not_started={}",
            summary.outcomes, summary.cancelled, summary.not_started
        );
        Ok(summary)
    }

    /// One deal: evaluate, persist, then forward. Never fails the cycle.
    async fn attempt(&self, deal: Deal, forward: bool, cancel: CancellationToken) -> TaskReport {
        let Some(evaluation) = self.evaluate(&deal, &cancel).await else {
            debug!("[Retrieve] Deal {} cancelled before completion", deal.deal_id);
            return TaskReport::Cancelled;
        };

        let label = evaluation.outcome.label();
        if let Some(message) = &evaluation.outcome.err_msg {
            debug!("[Retrieve] Deal {} -> {}: {}", deal.deal_id, label, message);
        }

        let persisted = match self
            .repository
            .update_outcome(deal.deal_id, evaluation.outcome)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("[Retrieve] Failed to record outcome for deal {}: {}", deal.deal_id, e);
                false
            }
        };

        let mut forwarded = false;
        if forward {
            if let (Some(sink), Some((root, block))) = (&self.sink, &evaluation.verified) {
                match sink.submit(root, block).await {
                    Ok(()) => forwarded = true,
                    Err(e) => warn!("[Retrieve] Failed to forward {}: {}", root, e),
                }
            }
        }

        TaskReport::Completed {
            label,
            persisted,
            forwarded,
        }
    }

    /// Runs the check for one deal. `None` means cancelled.
    async fn evaluate(&self, deal: &Deal, cancel: &CancellationToken) -> Option<Evaluation> {
        let root = match deal.payload_cid.parse::<Cid>() {
            Ok(root) => root,
            Err(e) => {
                return Some(Evaluation::failed(
                    None,
                    FetchResult::Error,
                    format!("invalid payload cid '{}': {}", deal.payload_cid, e),
                ))
            }
        };

        let peer_id = match cancellable(cancel, self.chain.query_provider_identity(&deal.provider)).await? {
            Ok(Some(peer_id)) => peer_id,
            Ok(None) => {
                return Some(Evaluation::failed(
                    None,
                    FetchResult::Error,
                    format!("provider {} has no peer identity on chain", deal.provider),
                ))
            }
            Err(e) => {
                return Some(Evaluation::failed(
                    None,
                    FetchResult::Error,
                    format!("resolve provider identity: {e}"),
                ))
            }
        };

        let (candidate, indexer_result) = match self.settings.strategy {
            CandidateStrategy::Indexer => {
                let candidates = match cancellable(cancel, self.indexer.find_candidates(&root)).await? {
                    Ok(candidates) => candidates,
                    Err(e) => {
                        return Some(Evaluation::failed(
                            None,
                            FetchResult::Error,
                            format!("indexer lookup failed: {e}"),
                        ))
                    }
                };
                let total = candidates.len();
                match select_candidate(candidates, &root, &peer_id) {
                    Some(candidate) => (candidate, Some(IndexerResult::Ok)),
                    None => {
                        return Some(Evaluation {
                            outcome: RetrievalOutcome::indexer_miss(format!(
                                "no candidate from {peer_id} advertises {root} ({total} record(s) returned)"
                            )),
                            verified: None,
                        })
                    }
                }
            }
            CandidateStrategy::Direct => {
                let addrs = self
                    .settings
                    .direct_endpoints
                    .get(&deal.provider)
                    .filter(|addrs| !addrs.is_empty())
                    .cloned();
                let Some(addrs) = addrs else {
                    return Some(Evaluation::failed(
                        None,
                        FetchResult::Error,
                        format!("no endpoints configured for provider {}", deal.provider),
                    ));
                };
                let candidate = RetrievalCandidate {
                    root: root.clone(),
                    peer_id,
                    addrs,
                    metadata: http_metadata(),
                };
                (candidate, None)
            }
        };

        let protocols = match parse_transport_metadata(&candidate.metadata) {
            Ok(protocols) => protocols,
            Err(e) => {
                return Some(Evaluation::failed(
                    indexer_result,
                    FetchResult::Error,
                    format!("unusable candidate: {e}"),
                ))
            }
        };

        let request = FetchRequest {
            root: root.clone(),
            peer_id: candidate.peer_id,
            addrs: candidate.addrs,
            protocols,
        };
        let fetched = match self.retrieval.fetch_block(request, cancel.clone()).await {
            Ok(fetched) => fetched,
            Err(FetchError::Cancelled) => return None,
            Err(FetchError::Failed(message)) => {
                let class = classify_fetch_error(&message);
                return Some(Evaluation::failed(indexer_result, class, message));
            }
        };
        debug!(
            "[Retrieve] Deal {} fetched {} bytes from {} in {:?}",
            deal.deal_id, fetched.stats.bytes, fetched.stats.endpoint, fetched.stats.duration
        );

        if let Err(e) = verify(&root, &fetched.bytes) {
            return Some(Evaluation::failed(
                indexer_result,
                FetchResult::Error,
                e.to_string(),
            ));
        }

        Some(Evaluation {
            outcome: RetrievalOutcome::success(indexer_result),
            verified: Some((root, fetched.bytes)),
        })
    }

    /// Runs a cycle every configured interval until cancelled. Cycles never
    /// overlap.
    pub async fn run_periodic(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "[Retrieve] Periodic scheduler every {:?}",
            self.settings.interval.max(MIN_INTERVAL)
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_cycle(self.periodic_plan(), &cancel).await {
                warn!("[Retrieve] Periodic cycle failed: {}", e);
            }
        }
        info!("[Retrieve] Periodic scheduler stopped");
    }
}
