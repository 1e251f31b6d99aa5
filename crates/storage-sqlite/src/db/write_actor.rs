//! Serializes every write through one dedicated thread.
//!
//! SQLite allows a single writer at a time; funnelling writes through one
//! queue avoids `SQLITE_BUSY` storms under concurrent retrieval workers.
//! Each job runs inside its own transaction.

use diesel::{Connection, SqliteConnection};
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use dealbot_core::errors::{DatabaseError, Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

/// Carries either the job's own error or a diesel failure out of
/// `Connection::transaction`, which needs `From<diesel::result::Error>`.
enum TxError {
    Job(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Diesel(err)
    }
}

impl WriteHandle {
    /// Runs `job` on the writer thread inside a transaction. An `Err` from the
    /// job rolls the transaction back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let boxed: Job = Box::new(move |conn: &mut SqliteConnection| {
            let result = conn
                .transaction::<T, TxError, _>(|tx| job(tx).map_err(TxError::Job))
                .map_err(|e| match e {
                    TxError::Job(err) => err,
                    TxError::Diesel(err) => StorageError::from(err).into(),
                });
            if reply_tx.send(result).is_err() {
                debug!("[Registry] Write caller went away before the reply");
            }
        });

        self.tx.send(boxed).map_err(|_| writer_gone())?;
        reply_rx.await.map_err(|_| writer_gone())?
    }
}

fn writer_gone() -> Error {
    Error::Database(DatabaseError::WriterUnavailable(
        "registry writer has stopped".to_string(),
    ))
}

/// Starts the writer thread. It exits once every handle is dropped.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("dealbot-db-writer".to_string())
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                match pool.get() {
                    Ok(mut conn) => job(&mut *conn),
                    // dropping the job drops its reply channel; the caller sees
                    // WriterUnavailable
                    Err(e) => error!("[Registry] Writer could not get a connection: {}", e),
                }
            }
            debug!("[Registry] Writer thread stopped");
        });
    if let Err(e) = spawned {
        error!("[Registry] Failed to start writer thread: {}", e);
    }
    WriteHandle { tx }
}
