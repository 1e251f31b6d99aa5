//! HTTP client for the downstream block sink.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use dealbot_core::cid::Cid;
use dealbot_core::retrieval::BlockSink;
use dealbot_core::{Error, Result};

use crate::error::NetworkError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct BlockSubmission {
    root: String,
    /// Base64 of the verified block.
    block: String,
}

/// Posts verified blocks to `http://{addr}/block`.
#[derive(Debug, Clone)]
pub struct HttpBlockSink {
    client: reqwest::Client,
    url: String,
}

impl HttpBlockSink {
    pub fn new(addr: &str) -> std::result::Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: format!("http://{}/block", addr.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl BlockSink for HttpBlockSink {
    async fn submit(&self, root: &Cid, block: &[u8]) -> Result<()> {
        let payload = BlockSubmission {
            root: root.to_string(),
            block: BASE64.encode(block),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::sink(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::sink(format!(
                "{} returned {}: {}",
                self.url,
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(())
    }
}
