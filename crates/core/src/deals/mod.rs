//! Deal registry domain models and repository contract.

mod deals_model;
mod deals_traits;

pub use deals_model::*;
pub use deals_traits::*;
