//! Chain-facing models and the client contract used by the listener and the
//! retrieval scheduler.

mod chain_model;
mod chain_traits;

pub use chain_model::*;
pub use chain_traits::*;
