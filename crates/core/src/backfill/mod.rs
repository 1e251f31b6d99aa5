//! Historical deal import from a compressed market snapshot.

mod backfill_model;
mod backfill_service;

pub use backfill_model::*;
pub use backfill_service::*;
