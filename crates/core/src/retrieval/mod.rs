//! Retrieval scheduling: candidate discovery, single-block fetch, content
//! verification, outcome classification and persistence.

mod classify;
mod retrieval_model;
mod retrieval_service;
mod retrieval_traits;
mod transport;

pub use classify::*;
pub use retrieval_model::*;
pub use retrieval_service::*;
pub use retrieval_traits::*;
pub use transport::*;
