//! HTTP implementations of the external capabilities used by the dealbot
//! pipelines: chain node, content indexer, retrieval gateway, object stores
//! and the downstream block sink.

pub mod error;
pub mod gateway;
pub mod indexer;
pub mod lotus;
pub mod multiaddr;
pub mod object_store;
pub mod sink;

pub use error::{NetworkError, RetryClass};
pub use gateway::HttpRetrievalClient;
pub use indexer::IpniIndexerClient;
pub use lotus::LotusClient;
pub use object_store::{FsObjectStore, HttpObjectStore};
pub use sink::HttpBlockSink;
