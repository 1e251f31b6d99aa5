//! IPNI content indexer client (`GET /multihash/{mh}`).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;

use dealbot_core::cid::{Cid, Multihash};
use dealbot_core::retrieval::{IndexerClient, RetrievalCandidate};
use dealbot_core::Error;

use crate::error::{NetworkError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FindResponse {
    #[serde(default)]
    multihash_results: Vec<MultihashResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MultihashResult {
    multihash: String,
    #[serde(default)]
    provider_results: Vec<ProviderResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProviderResult {
    #[serde(default)]
    metadata: Option<String>,
    provider: AddrInfo,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addrs", default)]
    addrs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IpniIndexerClient {
    client: reqwest::Client,
    base_url: String,
}

impl IpniIndexerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn lookup(&self, root: &Cid) -> Result<Vec<RetrievalCandidate>> {
        let url = format!("{}/multihash/{}", self.base_url, root.hash().to_base58());
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("[Indexer] No records for {}", root);
            return Ok(Vec::new());
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(NetworkError::api(status.as_u16(), body));
        }

        let parsed: FindResponse = serde_json::from_str(&body)?;
        let mut candidates = Vec::new();
        for result in parsed.multihash_results {
            let record_root = match decode_record_root(root, &result.multihash) {
                Ok(record_root) => record_root,
                Err(e) => {
                    warn!("[Indexer] Skipping multihash record for {}: {}", root, e);
                    continue;
                }
            };

            for provider in result.provider_results {
                let metadata = match provider.metadata.as_deref() {
                    Some(encoded) => match BASE64.decode(encoded) {
                        Ok(metadata) => metadata,
                        Err(e) => {
                            warn!(
                                "[Indexer] Skipping record from {}: bad metadata: {}",
                                provider.provider.id, e
                            );
                            continue;
                        }
                    },
                    None => Vec::new(),
                };
                candidates.push(RetrievalCandidate {
                    root: record_root.clone(),
                    peer_id: provider.provider.id,
                    addrs: provider.provider.addrs,
                    metadata,
                });
            }
        }
        Ok(candidates)
    }
}

/// Records are keyed by multihash; they answer for the requested codec.
fn decode_record_root(root: &Cid, encoded: &str) -> Result<Cid> {
    let mh_bytes = BASE64
        .decode(encoded)
        .map_err(|e| NetworkError::invalid_response(format!("multihash: {e}")))?;
    let hash = Multihash::from_bytes(&mh_bytes)
        .map_err(|e| NetworkError::invalid_response(format!("multihash: {e}")))?;
    root.with_hash(hash)
        .map_err(|e| NetworkError::invalid_response(e.to_string()))
}

#[async_trait]
impl IndexerClient for IpniIndexerClient {
    async fn find_candidates(&self, root: &Cid) -> dealbot_core::Result<Vec<RetrievalCandidate>> {
        self.lookup(root)
            .await
            .map_err(|e| Error::indexer(e.to_string()))
    }
}
