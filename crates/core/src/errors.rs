//! Error types shared by every dealbot pipeline.

use thiserror::Error;

use crate::car::CarError;
use crate::cid::{CidError, VerifyError};

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid content identifier: {0}")]
    Cid(#[from] CidError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("Chain client error: {0}")]
    Chain(String),

    #[error("Indexer error: {0}")]
    Indexer(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Object storage error: {0}")]
    ObjectStore(String),

    #[error("Container error: {0}")]
    Container(#[from] CarError),

    #[error("Block sink error: {0}")]
    Sink(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Writer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

impl Error {
    pub fn chain(message: impl Into<String>) -> Self {
        Self::Chain(message.into())
    }

    pub fn indexer(message: impl Into<String>) -> Self {
        Self::Indexer(message.into())
    }

    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::Retrieval(message.into())
    }

    pub fn object_store(message: impl Into<String>) -> Self {
        Self::ObjectStore(message.into())
    }

    pub fn sink(message: impl Into<String>) -> Self {
        Self::Sink(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True when the error was raised because the caller asked to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
