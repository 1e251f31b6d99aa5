//! Lotus JSON-RPC chain client.
//!
//! Calls go to the configured endpoints in order; a retryable failure moves on
//! to the next endpoint. Actor event subscriptions are implemented by polling
//! `Filecoin.GetActorEventsRaw` over the heights produced since the last poll.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use dealbot_core::chain::{
    ActorEvent, ActorEventFilter, ChainClient, DealProposal, EventEntry, MarketDeal,
};
use dealbot_core::config::LotusEndpoint;
use dealbot_core::Error;

use crate::error::{NetworkError, Result, RetryClass};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct TipSetHeader {
    #[serde(rename = "Height")]
    height: i64,
}

#[derive(Deserialize)]
struct MinerInfo {
    #[serde(rename = "PeerId")]
    peer_id: Option<String>,
}

#[derive(Serialize)]
struct RawEventBlock {
    codec: u64,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawEventFilter {
    addresses: Vec<String>,
    fields: BTreeMap<String, Vec<RawEventBlock>>,
    from_height: i64,
    to_height: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEventEntry {
    flags: u64,
    key: String,
    codec: u64,
    value: String,
}

#[derive(Deserialize)]
struct CidLink {
    #[serde(rename = "/")]
    link: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActorEvent {
    #[serde(default)]
    entries: Vec<RawEventEntry>,
    emitter: String,
    #[serde(default)]
    reverted: bool,
    height: i64,
    msg_cid: Option<CidLink>,
}

impl RawEventFilter {
    fn new(filter: &ActorEventFilter, from_height: i64, to_height: i64) -> Self {
        let fields = filter
            .fields
            .iter()
            .map(|(key, blocks)| {
                let blocks = blocks
                    .iter()
                    .map(|b| RawEventBlock {
                        codec: b.codec,
                        value: BASE64.encode(&b.value),
                    })
                    .collect();
                (key.clone(), blocks)
            })
            .collect();
        Self {
            addresses: filter.addresses.clone(),
            fields,
            from_height,
            to_height,
        }
    }
}

impl TryFrom<RawActorEvent> for ActorEvent {
    type Error = NetworkError;

    fn try_from(raw: RawActorEvent) -> Result<Self> {
        let entries = raw
            .entries
            .into_iter()
            .map(|e| {
                let value = BASE64.decode(&e.value).map_err(|err| {
                    NetworkError::invalid_response(format!("event entry '{}': {}", e.key, err))
                })?;
                Ok(EventEntry {
                    flags: e.flags,
                    key: e.key,
                    codec: e.codec,
                    value,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ActorEvent {
            entries,
            emitter: raw.emitter,
            reverted: raw.reverted,
            height: raw.height,
            msg_cid: raw.msg_cid.map(|c| c.link),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LotusClient {
    client: reqwest::Client,
    endpoints: Arc<Vec<LotusEndpoint>>,
    poll_interval: Duration,
    next_id: Arc<AtomicU64>,
}

impl LotusClient {
    pub fn new(endpoints: Vec<LotusEndpoint>, poll_interval: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(NetworkError::invalid_request("no lotus endpoints configured"));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoints: Arc::new(endpoints),
            poll_interval: if poll_interval.is_zero() {
                DEFAULT_POLL_INTERVAL
            } else {
                poll_interval
            },
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Issues one JSON-RPC call, failing over across endpoints on retryable
    /// errors.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let mut last_err = None;
        for endpoint in self.endpoints.iter() {
            match self.call_endpoint(endpoint, method, &body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.retry_class() == RetryClass::Retryable => {
                    warn!("[Lotus] {} failed on {}: {}", method, endpoint.url, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| NetworkError::invalid_request("no lotus endpoints configured")))
    }

    async fn call_endpoint<T: DeserializeOwned>(
        &self,
        endpoint: &LotusEndpoint,
        method: &str,
        body: &Value,
    ) -> Result<T> {
        let mut request = self.client.post(&endpoint.url).json(body);
        if let Some(token) = &endpoint.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(NetworkError::api(status.as_u16(), text));
        }

        let envelope: RpcEnvelope = serde_json::from_str(&text)?;
        if let Some(err) = envelope.error {
            return Err(NetworkError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        serde_json::from_value(envelope.result).map_err(|e| {
            NetworkError::invalid_response(format!("{method}: unexpected result: {e}"))
        })
    }

    pub async fn chain_head_height(&self) -> Result<i64> {
        let head: TipSetHeader = self.call("Filecoin.ChainHead", json!([])).await?;
        Ok(head.height)
    }

    pub async fn get_actor_events(
        &self,
        filter: &ActorEventFilter,
        from_height: i64,
        to_height: i64,
    ) -> Result<Vec<ActorEvent>> {
        let raw_filter = RawEventFilter::new(filter, from_height, to_height);
        let events: Option<Vec<RawActorEvent>> = self
            .call("Filecoin.GetActorEventsRaw", json!([raw_filter]))
            .await?;
        events
            .unwrap_or_default()
            .into_iter()
            .map(ActorEvent::try_from)
            .collect()
    }

    async fn poll_events(
        self,
        filter: ActorEventFilter,
        mut next_height: i64,
        tx: mpsc::Sender<ActorEvent>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tx.closed() => return,
                _ = ticker.tick() => {}
            }

            let head = match self.chain_head_height().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("[Lotus] Event poll stopped, chain head unavailable: {}", e);
                    return;
                }
            };
            if head < next_height {
                continue;
            }

            let events = match self.get_actor_events(&filter, next_height, head).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("[Lotus] Event poll stopped at height {}: {}", next_height, e);
                    return;
                }
            };
            debug!(
                "[Lotus] {} event(s) in heights {}..={}",
                events.len(),
                next_height,
                head
            );
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            next_height = head + 1;
        }
    }
}

fn chain_error(err: NetworkError) -> Error {
    Error::chain(err.to_string())
}

#[async_trait]
impl ChainClient for LotusClient {
    async fn subscribe_actor_events(
        &self,
        filter: ActorEventFilter,
        cancel: CancellationToken,
    ) -> dealbot_core::Result<mpsc::Receiver<ActorEvent>> {
        let head = self.chain_head_height().await.map_err(chain_error)?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(self.clone().poll_events(filter, head, tx, cancel));
        Ok(rx)
    }

    async fn query_deal_state(&self, deal_id: i64) -> dealbot_core::Result<DealProposal> {
        let deal: MarketDeal = self
            .call("Filecoin.StateMarketStorageDeal", json!([deal_id, null]))
            .await
            .map_err(chain_error)?;
        Ok(deal.proposal)
    }

    async fn query_provider_identity(&self, provider: &str) -> dealbot_core::Result<Option<String>> {
        let info: MinerInfo = self
            .call("Filecoin.StateMinerInfo", json!([provider, null]))
            .await
            .map_err(chain_error)?;
        Ok(info.peer_id.filter(|p| !p.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealbot_core::chain::ActorEventBlock;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    fn endpoint(server: &MockServer) -> LotusEndpoint {
        LotusEndpoint {
            url: server.uri(),
            token: None,
        }
    }

    #[tokio::test]
    async fn fails_over_to_next_endpoint() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&broken)
            .await;
        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.ChainHead"})))
            .and(header("authorization", "Bearer secret"))
            .respond_with(rpc_result(json!({"Height": 4200, "Cids": []})))
            .mount(&healthy)
            .await;

        let client = LotusClient::new(
            vec![
                endpoint(&broken),
                LotusEndpoint {
                    url: healthy.uri(),
                    token: Some("secret".into()),
                },
            ],
            DEFAULT_POLL_INTERVAL,
        )
        .unwrap();
        assert_eq!(client.chain_head_height().await.unwrap(), 4200);
    }

    #[tokio::test]
    async fn rpc_errors_do_not_fail_over() {
        let first = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": 1, "message": "deal 7 not found"}
            })))
            .mount(&first)
            .await;
        let second = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!(null)))
            .expect(0)
            .mount(&second)
            .await;

        let client =
            LotusClient::new(vec![endpoint(&first), endpoint(&second)], DEFAULT_POLL_INTERVAL)
                .unwrap();
        let err = client.query_deal_state(7).await.unwrap_err();
        assert!(err.to_string().contains("deal 7 not found"));
    }

    #[tokio::test]
    async fn reads_deal_state_and_peer_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateMarketStorageDeal", "params": [7, null]})))
            .respond_with(rpc_result(json!({
                "Proposal": {
                    "Client": "f01000", "Provider": "f02000", "Label": "bafy-label",
                    "StartEpoch": 10, "EndEpoch": 20, "PieceSize": 2048, "VerifiedDeal": false
                },
                "State": {"SectorStartEpoch": 9}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateMinerInfo", "params": ["f02000", null]})))
            .respond_with(rpc_result(json!({"Owner": "f0100", "PeerId": "12D3KooWPeer"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateMinerInfo", "params": ["f03000", null]})))
            .respond_with(rpc_result(json!({"Owner": "f0100", "PeerId": null})))
            .mount(&server)
            .await;

        let client = LotusClient::new(vec![endpoint(&server)], DEFAULT_POLL_INTERVAL).unwrap();
        let proposal = client.query_deal_state(7).await.unwrap();
        assert_eq!(proposal.provider, "f02000");
        assert_eq!(proposal.label.to_payload_string().unwrap(), "bafy-label");
        assert_eq!(
            client.query_provider_identity("f02000").await.unwrap().as_deref(),
            Some("12D3KooWPeer")
        );
        assert_eq!(client.query_provider_identity("f03000").await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscription_delivers_polled_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.ChainHead"})))
            .respond_with(rpc_result(json!({"Height": 100})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "Filecoin.GetActorEventsRaw",
                "params": [{"addresses": ["f05"], "fromHeight": 100, "toHeight": 100,
                            "fields": {"$type": [{"codec": 81, "value": "bmRlYWw="}]}}]
            })))
            .respond_with(rpc_result(json!([{
                "entries": [{"Flags": 3, "Key": "$type", "Codec": 81, "Value": "bmRlYWw="}],
                "emitter": "f05",
                "reverted": false,
                "height": 100,
                "tipsetKey": [],
                "msgCid": {"/": "bafy2bzacemsg"}
            }])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let mut filter = ActorEventFilter {
            addresses: vec!["f05".into()],
            ..Default::default()
        };
        filter.fields.insert(
            "$type".into(),
            vec![ActorEventBlock {
                codec: 0x51,
                value: b"ndeal".to_vec(),
            }],
        );

        let client =
            LotusClient::new(vec![endpoint(&server)], Duration::from_millis(20)).unwrap();
        let mut rx = client
            .subscribe_actor_events(filter, CancellationToken::new())
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.emitter, "f05");
        assert_eq!(event.height, 100);
        assert_eq!(event.msg_cid.as_deref(), Some("bafy2bzacemsg"));
        assert_eq!(event.entries[0].key, "$type");
        assert_eq!(event.entries[0].value, b"ndeal".to_vec());
        // the head stays at 100, so later polls have nothing to read
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancel_closes_the_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!({"Height": 1})))
            .mount(&server)
            .await;
        let client = LotusClient::new(vec![endpoint(&server)], Duration::from_secs(3600)).unwrap();
        let cancel = CancellationToken::new();
        let mut rx = client
            .subscribe_actor_events(ActorEventFilter::default(), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
