//! On-chain deal activation listener.

mod event_decoder;
mod listener;

pub use event_decoder::*;
pub use listener::*;
