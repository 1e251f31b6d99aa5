//! SQLite-backed deal registry.

pub mod db;
pub mod deals;
pub mod errors;
pub mod schema;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use deals::DealRepository;
pub use errors::StorageError;
