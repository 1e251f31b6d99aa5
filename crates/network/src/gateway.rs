//! Single-block retrieval over a provider's trustless HTTP gateway.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use dealbot_core::car::MAX_SECTION_SIZE;
use dealbot_core::cid::Cid;
use dealbot_core::retrieval::{
    FetchError, FetchRequest, FetchStats, FetchedBlock, RetrievalClient, TransportProtocol,
};

use crate::error::NetworkError;
use crate::multiaddr::multiaddr_to_url;

const RAW_BLOCK_CONTENT_TYPE: &str = "application/vnd.ipld.raw";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpRetrievalClient {
    client: reqwest::Client,
    timeout: Duration,
    max_block_size: u64,
}

impl HttpRetrievalClient {
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            timeout,
            max_block_size: MAX_SECTION_SIZE,
        })
    }

    /// Bodies larger than this are abandoned. Defaults to the container
    /// section limit.
    pub fn with_max_block_size(mut self, max_block_size: u64) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    async fn fetch_from(&self, base_url: &str, root: &Cid) -> Result<Vec<u8>, FetchError> {
        let url = format!("{base_url}/ipfs/{root}?dag-scope=block");
        let mut response = self
            .client
            .get(&url)
            .header(ACCEPT, RAW_BLOCK_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| FetchError::failed(format!("request to {base_url} failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::failed("not found"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::failed(format!(
                "gateway returned {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_block_size {
                return Err(self.too_large(base_url));
            }
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::failed(format!("reading body from {base_url}: {e}")))?
        {
            if (bytes.len() + chunk.len()) as u64 > self.max_block_size {
                return Err(self.too_large(base_url));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    fn too_large(&self, base_url: &str) -> FetchError {
        FetchError::failed(format!(
            "block from {base_url} exceeds {} bytes",
            self.max_block_size
        ))
    }
}

#[async_trait]
impl RetrievalClient for HttpRetrievalClient {
    async fn fetch_block(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
    ) -> Result<FetchedBlock, FetchError> {
        if !request.protocols.contains(&TransportProtocol::Http) {
            return Err(FetchError::failed(format!(
                "no supported retrieval protocol advertised by {}",
                request.peer_id
            )));
        }
        let endpoints: Vec<String> = request
            .addrs
            .iter()
            .filter_map(|addr| multiaddr_to_url(addr).ok())
            .collect();
        if endpoints.is_empty() {
            return Err(FetchError::failed(format!(
                "no http endpoint among {} address(es) of {}",
                request.addrs.len(),
                request.peer_id
            )));
        }

        let mut last_err = FetchError::failed("no endpoint attempted");
        for endpoint in endpoints {
            let started = Instant::now();
            let attempt = tokio::time::timeout(self.timeout, self.fetch_from(&endpoint, &request.root));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                outcome = attempt => outcome,
            };
            match outcome {
                Ok(Ok(bytes)) => {
                    let stats = FetchStats {
                        bytes: bytes.len() as u64,
                        duration: started.elapsed(),
                        endpoint,
                    };
                    debug!(
                        "[Retrieve] {} bytes of {} from {} in {:?}",
                        stats.bytes, request.root, stats.endpoint, stats.duration
                    );
                    return Ok(FetchedBlock { bytes, stats });
                }
                Ok(Err(e)) => {
                    debug!("[Retrieve] {} failed on {}: {}", request.root, endpoint, e);
                    last_err = e;
                }
                Err(_) => {
                    last_err = FetchError::failed(format!(
                        "retrieval timed out after {}s",
                        self.timeout.as_secs()
                    ));
                }
            }
        }
        Err(last_err)
    }
}
