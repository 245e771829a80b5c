//! # Reader Pool
//!
//! Reads issued through the async handle run on a pool of threads, each with
//! its own read-only connection to the database file. WAL mode lets them
//! read the latest committed state in parallel with the writer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                               │
//! │                                                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐             │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │             │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │             │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘             │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                 shared request channel                          │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            ▼
//!                    read-only connections ──► SQLite (WAL)
//! ```
//!
//! In-memory databases have no file to share, so the async handle sends
//! their reads to the writer instead and no pool is started.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::SchemaRegistry;

/// Capacity of the shared read channel.
pub const READ_CHANNEL_SIZE: usize = 1024;

type ReadJob = Box<dyn FnOnce(&Connection, &SchemaRegistry) + Send>;

enum ReadRequest {
    Run(ReadJob),
    Shutdown,
}

/// Cloneable sender side of the reader pool.
#[derive(Clone)]
pub struct ReaderPool {
    tx: mpsc::Sender<ReadRequest>,
    count: usize,
}

impl ReaderPool {
    /// Starts one thread per connection.
    pub(crate) fn spawn(connections: Vec<Connection>, schema: Arc<SchemaRegistry>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let rx = Arc::new(Mutex::new(rx));
        let count = connections.len();

        for (i, conn) in connections.into_iter().enumerate() {
            let rx = Arc::clone(&rx);
            let schema = Arc::clone(&schema);
            thread::Builder::new()
                .name(format!("spiteorm-reader-{i}"))
                .spawn(move || run_reader_pooled(conn, schema, rx))
                .map_err(|e| Error::WorkerClosed(format!("failed to spawn reader thread: {e}")))?;
        }

        debug!(readers = count, "reader pool started");
        Ok(Self { tx, count })
    }

    /// Number of reader threads.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Runs `job` on whichever reader is free.
    pub(crate) async fn call<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&Connection, &SchemaRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response, rx) = oneshot::channel();
        let job: ReadJob = Box::new(move |conn, schema| {
            let _ = response.send(job(conn, schema));
        });

        self.tx
            .send(ReadRequest::Run(job))
            .await
            .map_err(|_| Error::WorkerClosed("reader pool has stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::WorkerClosed("reader dropped the request".to_string()))?
    }

    /// Stops every reader once the requests ahead of it are served.
    pub(crate) async fn shutdown(&self) {
        for _ in 0..self.count {
            if self.tx.send(ReadRequest::Shutdown).await.is_err() {
                break;
            }
        }
    }
}

/// Pooled reader loop.
///
/// Threads compete for the shared receiver; whichever is free takes the next
/// request.
fn run_reader_pooled(conn: Connection, schema: Arc<SchemaRegistry>, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = rx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.blocking_recv()
        };

        match request {
            Some(ReadRequest::Run(job)) => job(&conn, &schema),
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
    debug!("reader stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OpenFlags;

    fn pool(dir: &tempfile::TempDir, readers: usize) -> ReaderPool {
        let path = dir.path().join("readers.db");
        let writer = Connection::open(&path).unwrap();
        writer
            .execute_batch("PRAGMA journal_mode = WAL; CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (41);")
            .unwrap();

        let connections = (0..readers)
            .map(|_| {
                Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
                    .unwrap()
            })
            .collect();
        ReaderPool::spawn(connections, Arc::new(SchemaRegistry::new(1))).unwrap()
    }

    #[tokio::test]
    async fn test_reads_run_on_pool() {
        let dir = tempfile::tempdir().unwrap();
        let readers = pool(&dir, 2);
        assert_eq!(readers.count(), 2);

        let v: i64 = readers
            .call(|conn, _| Ok(conn.query_row("SELECT v + 1 FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_readers_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let readers = pool(&dir, 1);
        let result = readers
            .call(|conn, _| Ok(conn.execute("INSERT INTO t VALUES (1)", [])?))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_readers() {
        let dir = tempfile::tempdir().unwrap();
        let readers = pool(&dir, 2);
        readers.shutdown().await;
        // Both threads exit and drop the receiver.
        for _ in 0..100 {
            if readers.tx.is_closed() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("reader pool did not stop");
    }
}
