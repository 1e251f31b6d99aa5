//! Object stores holding archived containers.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use tokio_util::io::StreamReader;

use dealbot_core::car::{ObjectStore, ObjectStream};
use dealbot_core::{Error, Result};

use crate::error::NetworkError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads objects with `GET {base_url}/{key}`, streaming the body.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: &str) -> std::result::Result<Self, NetworkError> {
        // no overall timeout: containers stream for as long as they need
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn download_stream(&self, key: &str) -> Result<ObjectStream> {
        let url = format!("{}/{}", self.base_url, key.trim_start_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::object_store(format!("{key}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::object_store(format!(
                "{key}: store returned {}",
                status.as_u16()
            )));
        }
        debug!("[Car] Streaming {}", url);
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}

/// Reads objects from a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::object_store(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download_stream(&self, key: &str) -> Result<ObjectStream> {
        let path = self.resolve(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::object_store(format!("{}: {e}", path.display())))?;
        Ok(Box::new(file))
    }
}
