//! Deal lifecycle pipelines for a decentralized storage network.
//!
//! Deals enter the registry from on-chain activation events or from a market
//! snapshot, and are then periodically retrieved from their providers and
//! verified against their content identifiers.

pub mod backfill;
pub mod car;
pub mod chain;
pub mod cid;
pub mod config;
pub mod deals;
pub mod errors;
pub mod onchain;
pub mod retrieval;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{DatabaseError, Error, Result};
