use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::Result;

pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

/// Read access to archived containers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams the object stored under `key` from the beginning.
    async fn download_stream(&self, key: &str) -> Result<ObjectStream>;
}
