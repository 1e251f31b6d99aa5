use dealbot_core::errors::{DatabaseError, Error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let db = match err {
            StorageError::Pool(e) => DatabaseError::ConnectionFailed(e.to_string()),
            StorageError::Connection(e) => DatabaseError::ConnectionFailed(e.to_string()),
            StorageError::Query(e) => DatabaseError::QueryFailed(e.to_string()),
            StorageError::Migration(e) => DatabaseError::MigrationFailed(e),
            StorageError::InvalidValue(e) => DatabaseError::InvalidValue(e),
        };
        Error::Database(db)
    }
}
