//! # Writer Thread
//!
//! The async handle funnels every write through one dedicated thread that
//! owns the [`Database`] (and with it the write connection and the Change
//! Notifier). Requests are closures; each carries a oneshot for its result.
//!
//! ```text
//! ┌──────────────┐  WriteRequest::Run(job)   ┌──────────────────────────┐
//! │ async caller │ ────────────────────────► │ writer thread            │
//! │              │                           │   job(&mut Database)     │
//! │   .await     │ ◄──────────────────────── │   commit ─► notify       │
//! └──────────────┘       oneshot result      └──────────────────────────┘
//! ```
//!
//! A single writer matches the engine's own single-writer model: there is no
//! lock contention between our writes, and live queries are re-evaluated on
//! the thread that committed, in commit order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::database::Database;
use crate::error::{Error, Result};

/// Capacity of the request channel; senders wait when it is full.
pub const WRITE_CHANNEL_SIZE: usize = 1024;

type WriteJob = Box<dyn FnOnce(&mut Database) + Send>;

pub(crate) enum WriteRequest {
    Run(WriteJob),
    /// Stop after the requests already queued; `done` fires once the
    /// database is closed.
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable sender side of the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Runs `job` on the writer thread and waits for its result.
    pub(crate) async fn call<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response, rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |db| {
            let _ = response.send(job(db));
        });

        self.tx
            .send(WriteRequest::Run(job))
            .await
            .map_err(|_| Error::WorkerClosed("writer thread has stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::WorkerClosed("writer dropped the request".to_string()))?
    }

    /// Asks the writer to finish queued work and close the database.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest::Shutdown { done })
            .await
            .map_err(|_| Error::WorkerClosed("writer thread has stopped".to_string()))?;
        let _ = rx.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writer loop. Runs until shutdown or until every handle is dropped.
fn run_writer(mut db: Database, mut rx: mpsc::Receiver<WriteRequest>) {
    debug!(path = ?db.path(), "writer started");
    let mut done = None;

    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Run(job) => {
                // A panicking job drops its oneshot; the caller sees WorkerClosed.
                if catch_unwind(AssertUnwindSafe(|| job(&mut db))).is_err() {
                    error!("write job panicked");
                }
            }
            WriteRequest::Shutdown { done: ack } => {
                done = Some(ack);
                break;
            }
        }
    }

    drop(rx);
    drop(db);
    debug!("writer stopped");
    if let Some(ack) = done {
        let _ = ack.send(());
    }
}

/// Moves `db` onto a new writer thread.
pub(crate) fn spawn_writer(db: Database) -> Result<WriterHandle> {
    let (tx, rx) = mpsc::channel(WRITE_CHANNEL_SIZE);

    thread::Builder::new()
        .name("spiteorm-writer".to_string())
        .spawn(move || run_writer(db, rx))
        .map_err(|e| Error::WorkerClosed(format!("failed to spawn writer thread: {e}")))?;

    Ok(WriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;

    fn handle() -> WriterHandle {
        let db = Database::open_in_memory(SchemaRegistry::new(3)).unwrap();
        spawn_writer(db).unwrap()
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let writer = handle();
        let version = writer.call(|db| Ok(db.schema().version())).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let writer = handle();
        let err = writer
            .call(|_| -> Result<()> { Err(Error::UnknownQuery("nope".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownQuery(_)));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_writer() {
        let writer = handle();
        let err = writer
            .call(|_| -> Result<()> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerClosed(_)));

        assert_eq!(writer.call(|db| Ok(db.schema().version())).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let writer = handle();
        writer.shutdown().await.unwrap();
        let err = writer.call(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::WorkerClosed(_)));
    }
}
