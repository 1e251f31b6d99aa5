use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event_decoder::{cbor_block, decode_deal_activated, DealActivated, EVENT_TYPE_KEY};
use crate::chain::{
    id_address, parse_id_address, ActorEvent, ActorEventFilter, ChainClient,
    DEAL_ACTIVATED_EVENT, STORAGE_MARKET_ACTOR_ID,
};
use crate::deals::{DealRepositoryTrait, NewDeal};
use crate::errors::{Error, Result};

/// Delay before retrying a failed or dropped subscription.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Provider ID addresses to watch. Empty means every provider.
    pub providers: Vec<String>,
    /// `f` on mainnet, `t` on test networks.
    pub network_prefix: String,
    pub resubscribe_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            network_prefix: "f".to_string(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Subscribing,
    Streaming,
}

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Inserted,
    Duplicate,
    /// Reverted, or from a provider outside the watched set.
    Ignored,
    /// The event disagreed with the chain's deal state.
    Rejected,
}

enum Step {
    Cancelled,
    Closed,
    Event(ActorEvent),
}

/// Subscribes to deal activation events and records the activated deals.
pub struct OnChainListener {
    chain: Arc<dyn ChainClient>,
    repository: Arc<dyn DealRepositoryTrait>,
    config: ListenerConfig,
    provider_ids: HashSet<u64>,
}

impl OnChainListener {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        repository: Arc<dyn DealRepositoryTrait>,
        config: ListenerConfig,
    ) -> Result<Self> {
        let provider_ids = config
            .providers
            .iter()
            .map(|p| parse_id_address(p))
            .collect::<Result<HashSet<u64>>>()?;
        Ok(Self {
            chain,
            repository,
            config,
            provider_ids,
        })
    }

    /// Emitter = storage market actor, `$type` = deal-activated and, when
    /// providers are configured, `provider` in that set.
    pub fn event_filter(&self) -> Result<ActorEventFilter> {
        let mut filter = ActorEventFilter {
            addresses: vec![id_address(
                &self.config.network_prefix,
                STORAGE_MARKET_ACTOR_ID,
            )],
            ..Default::default()
        };
        filter.fields.insert(
            EVENT_TYPE_KEY.to_string(),
            vec![cbor_block(&DEAL_ACTIVATED_EVENT)?],
        );
        if !self.provider_ids.is_empty() {
            let mut ids: Vec<u64> = self.provider_ids.iter().copied().collect();
            ids.sort_unstable();
            let blocks = ids.iter().map(cbor_block).collect::<Result<Vec<_>>>()?;
            filter.fields.insert("provider".to_string(), blocks);
        }
        Ok(filter)
    }

    /// Runs until `cancel` fires, resubscribing whenever the stream fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let filter = self.event_filter()?;
        let mut state = ListenerState::Disconnected;
        let mut events: Option<mpsc::Receiver<ActorEvent>> = None;

        loop {
            let Some(rx) = events.as_mut() else {
                state = self.transition(state, ListenerState::Subscribing);
                let subscribed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = self.chain.subscribe_actor_events(filter.clone(), cancel.child_token()) => res,
                };
                match subscribed {
                    Ok(rx) => {
                        state = self.transition(state, ListenerState::Streaming);
                        events = Some(rx);
                    }
                    Err(e) => {
                        warn!(
                            "[OnChain] Subscription failed: {}. Retrying in {:?}",
                            e, self.config.resubscribe_delay
                        );
                        state = self.transition(state, ListenerState::Disconnected);
                        if self.wait_before_retry(&cancel).await {
                            break;
                        }
                    }
                }
                continue;
            };

            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Cancelled,
                ev = rx.recv() => ev.map(Step::Event).unwrap_or(Step::Closed),
            };

            match step {
                Step::Cancelled => break,
                Step::Closed => {
                    warn!(
                        "[OnChain] Event stream closed. Resubscribing in {:?}",
                        self.config.resubscribe_delay
                    );
                    events = None;
                    state = self.transition(state, ListenerState::Disconnected);
                    if self.wait_before_retry(&cancel).await {
                        break;
                    }
                }
                Step::Event(event) => match self.handle_event(&event).await {
                    Ok(disposition) => {
                        debug!(
                            "[OnChain] Event at height {} -> {:?}",
                            event.height, disposition
                        );
                    }
                    Err(e) => {
                        error!("[OnChain] Failed to process event at height {}: {}", event.height, e);
                    }
                },
            }
        }

        info!("[OnChain] Listener stopped");
        Ok(())
    }

    fn transition(&self, from: ListenerState, to: ListenerState) -> ListenerState {
        if from != to {
            debug!("[OnChain] {:?} -> {:?}", from, to);
        }
        to
    }

    /// Returns `true` if cancelled while waiting.
    async fn wait_before_retry(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.resubscribe_delay) => false,
        }
    }

    /// Decodes one event, cross-checks it against the chain and records the
    /// deal. Failures affect this event only.
    pub async fn handle_event(&self, event: &ActorEvent) -> Result<EventDisposition> {
        if event.reverted {
            return Ok(EventDisposition::Ignored);
        }

        let activated = decode_deal_activated(event)
            .map_err(|e| Error::invalid_input(format!("malformed deal event: {e}")))?;
        if activated.deal_id == 0 || activated.client_id == 0 || activated.provider_id == 0 {
            debug!("[OnChain] Ignoring activation with a zero field: {:?}", activated);
            return Ok(EventDisposition::Ignored);
        }
        if !self.provider_ids.is_empty() && !self.provider_ids.contains(&activated.provider_id) {
            return Ok(EventDisposition::Ignored);
        }

        let deal_id = i64::try_from(activated.deal_id)
            .map_err(|_| Error::invalid_input(format!("deal id {} out of range", activated.deal_id)))?;
        let proposal = self.chain.query_deal_state(deal_id).await?;

        if !self.matches_chain_state(&activated, &proposal.client, &proposal.provider) {
            warn!(
                "[OnChain] Deal {} rejected: event says client {} provider {}, chain says client {} provider {}",
                deal_id,
                activated.client_id,
                activated.provider_id,
                proposal.client,
                proposal.provider
            );
            return Ok(EventDisposition::Rejected);
        }

        let payload_cid = proposal
            .label
            .to_payload_string()
            .map_err(|e| Error::invalid_input(format!("deal {deal_id}: {e}")))?;

        let inserted = self
            .repository
            .insert_if_absent(NewDeal {
                deal_id,
                payload_cid,
                client: proposal.client,
                provider: proposal.provider,
                start_epoch: proposal.start_epoch,
                end_epoch: proposal.end_epoch,
            })
            .await?;

        if inserted {
            info!("[OnChain] Recorded activated deal {}", deal_id);
            Ok(EventDisposition::Inserted)
        } else {
            Ok(EventDisposition::Duplicate)
        }
    }

    fn matches_chain_state(&self, activated: &DealActivated, client: &str, provider: &str) -> bool {
        let prefix = &self.config.network_prefix;
        id_address(prefix, activated.client_id) == client
            && id_address(prefix, activated.provider_id) == provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{DealLabel, DealProposal};
    use crate::onchain::event_decoder::test_support::{activation_event, entry};
    use crate::testing::{MemoryDealRepository, StaticChain};

    fn proposal(client: &str, provider: &str, label: &str) -> DealProposal {
        DealProposal {
            client: client.to_string(),
            provider: provider.to_string(),
            label: DealLabel::Text(label.to_string()),
            start_epoch: 100,
            end_epoch: 200,
            piece_size: 0,
            verified_deal: false,
        }
    }

    fn listener(
        chain: Arc<StaticChain>,
        repo: Arc<MemoryDealRepository>,
        providers: &[&str],
    ) -> OnChainListener {
        OnChainListener::new(
            chain,
            repo,
            ListenerConfig {
                providers: providers.iter().map(|p| p.to_string()).collect(),
                resubscribe_delay: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn matching_event_inserts_once() {
        let chain = Arc::new(StaticChain::default());
        chain.set_deal(42, proposal("f01000", "f02000", "bafy-payload"));
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = listener(chain, repo.clone(), &["f02000"]);

        let event = activation_event(42, 1000, 2000);
        assert_eq!(
            listener.handle_event(&event).await.unwrap(),
            EventDisposition::Inserted
        );
        assert_eq!(
            listener.handle_event(&event).await.unwrap(),
            EventDisposition::Duplicate
        );

        let deal = repo.deal(42).unwrap();
        assert_eq!(deal.payload_cid, "bafy-payload");
        assert_eq!(deal.provider, "f02000");
        assert_eq!(deal.fetch_result, None);
        assert_eq!(deal.last_update, None);
    }

    #[tokio::test]
    async fn chain_disagreement_is_rejected() {
        let chain = Arc::new(StaticChain::default());
        chain.set_deal(42, proposal("f01000", "f03000", "bafy"));
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = listener(chain, repo.clone(), &[]);

        let disposition = listener
            .handle_event(&activation_event(42, 1000, 2000))
            .await
            .unwrap();
        assert_eq!(disposition, EventDisposition::Rejected);
        assert!(repo.deal(42).is_none());
    }

    #[tokio::test]
    async fn unexpected_entries_and_reverts_do_not_insert() {
        let chain = Arc::new(StaticChain::default());
        chain.set_deal(42, proposal("f01000", "f02000", "bafy"));
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = listener(chain, repo.clone(), &[]);

        let mut extra = activation_event(42, 1000, 2000);
        extra.entries.push(entry("sector", &7u64));
        assert!(listener.handle_event(&extra).await.is_err());

        let mut reverted = activation_event(42, 1000, 2000);
        reverted.reverted = true;
        assert_eq!(
            listener.handle_event(&reverted).await.unwrap(),
            EventDisposition::Ignored
        );
        assert!(repo.deal(42).is_none());
    }

    #[tokio::test]
    async fn zero_fields_are_ignored_without_chain_lookup() {
        let chain = Arc::new(StaticChain::default());
        chain.set_deal(0, proposal("f01000", "f02000", "bafy"));
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = listener(chain.clone(), repo.clone(), &[]);

        for event in [
            activation_event(0, 1000, 2000),
            activation_event(42, 0, 2000),
            activation_event(42, 1000, 0),
        ] {
            assert_eq!(
                listener.handle_event(&event).await.unwrap(),
                EventDisposition::Ignored
            );
        }
        assert_eq!(chain.deal_query_count(), 0);
        assert_eq!(repo.len(), 0);
    }

    #[tokio::test]
    async fn unwatched_provider_is_ignored() {
        let chain = Arc::new(StaticChain::default());
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = listener(chain, repo.clone(), &["f09999"]);
        assert_eq!(
            listener
                .handle_event(&activation_event(42, 1000, 2000))
                .await
                .unwrap(),
            EventDisposition::Ignored
        );
    }

    #[test]
    fn filter_targets_market_actor_and_providers() {
        let chain = Arc::new(StaticChain::default());
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = listener(chain, repo, &["f02000", "f01000"]);
        let filter = listener.event_filter().unwrap();
        assert_eq!(filter.addresses, vec!["f05".to_string()]);
        assert_eq!(filter.fields[EVENT_TYPE_KEY].len(), 1);
        let providers = &filter.fields["provider"];
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0], cbor_block(&1000u64).unwrap());
    }

    #[test]
    fn invalid_provider_address_fails_construction() {
        let result = OnChainListener::new(
            Arc::new(StaticChain::default()),
            Arc::new(MemoryDealRepository::default()),
            ListenerConfig {
                providers: vec!["not-an-address".into()],
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_resubscribes_after_stream_closes() {
        let chain = Arc::new(StaticChain::default());
        chain.set_deal(42, proposal("f01000", "f02000", "bafy"));
        chain.set_deal(43, proposal("f01000", "f02000", "bafz"));
        chain.push_subscription(Err(Error::chain("connection refused")));
        chain.push_subscription(Ok(vec![activation_event(42, 1000, 2000)]));
        chain.push_subscription(Ok(vec![activation_event(43, 1000, 2000)]));
        let repo = Arc::new(MemoryDealRepository::default());
        let listener = Arc::new(listener(chain.clone(), repo.clone(), &[]));

        let cancel = CancellationToken::new();
        let handle = {
            let listener = listener.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(cancel).await })
        };

        for _ in 0..200 {
            if repo.deal(43).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(repo.deal(42).is_some());
        assert!(repo.deal(43).is_some());
        assert!(chain.subscription_count() >= 3);
    }
}
