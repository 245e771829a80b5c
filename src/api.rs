//! # Async API
//!
//! [`AsyncDatabase`] is the non-blocking entry point. SQLite connections are
//! `!Sync`, so instead of sharing one we give each its own thread and talk
//! to it over channels:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Tokio Runtime                            │
//! │  task1 ─┐                                  ┌─ task4         │
//! │  task2 ─┼─ writes ──┐          ┌── reads ──┼─ task5         │
//! │  task3 ─┘           │          │           └─ task6         │
//! └─────────────────────┼──────────┼────────────────────────────┘
//!                       ▼          ▼
//!          ┌────────────────┐  ┌──────────────────────┐
//!          │ writer thread  │  │ reader pool (N)      │
//!          │ owns Database  │  │ read-only conns, WAL │
//!          └────────────────┘  └──────────────────────┘
//! ```
//!
//! Commands, transactions and live-query registration go to the writer.
//! Reads go to the pool. In-memory databases (or a pool configured with zero
//! threads) send reads to the writer too.
//!
//! Everything that crosses to another thread is owned: entities are passed
//! by value and transaction bodies must be `Send + 'static`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::database::{Database, DatabaseConfig};
use crate::error::Result;
use crate::mapper::{Entity, FromRow, FromValue, ToValue};
use crate::query::Args;
use crate::reader::ReaderPool;
use crate::relation::{self, Expanded};
use crate::schema::SchemaRegistry;
use crate::subscription::LiveQuery;
use crate::transaction::{self, Tx};
use crate::types::{ConflictPolicy, Value};
use crate::writer::{spawn_writer, WriterHandle};

/// Async handle to an open database. Cheap to clone; clones share the same
/// writer and readers.
///
/// # Example
///
/// ```rust,ignore
/// let db = AsyncDatabase::open("roster.db", schema).await?;
/// db.insert(Employee::new("Ann", 120), ConflictPolicy::Abort).await?;
/// let n: Option<i64> = db.fetch_value("employee.count", Args::new()).await?;
/// db.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AsyncDatabase {
    writer: WriterHandle,
    readers: Option<ReaderPool>,
    schema: Arc<SchemaRegistry>,
    path: Option<PathBuf>,
}

impl AsyncDatabase {
    /// Opens a file database with default configuration.
    pub async fn open<P: AsRef<Path>>(path: P, schema: SchemaRegistry) -> Result<Self> {
        Self::open_with_config(path, schema, DatabaseConfig::default()).await
    }

    pub async fn open_with_config<P: AsRef<Path>>(
        path: P,
        schema: SchemaRegistry,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let db = Database::open_with_config(path, schema, config)?;
        Self::start(db)
    }

    /// Opens an in-memory database. All work runs on the writer thread.
    pub async fn open_in_memory(schema: SchemaRegistry) -> Result<Self> {
        Self::start(Database::open_in_memory(schema)?)
    }

    fn start(db: Database) -> Result<Self> {
        let schema = db.shared_schema();
        let path = db.path().map(Path::to_path_buf);

        let mut connections: Vec<Connection> = Vec::with_capacity(db.config().reader_threads);
        for _ in 0..db.config().reader_threads {
            match db.open_reader()? {
                Some(conn) => connections.push(conn),
                None => break,
            }
        }
        let readers = if connections.is_empty() {
            None
        } else {
            Some(ReaderPool::spawn(connections, Arc::clone(&schema))?)
        };

        let writer = spawn_writer(db)?;
        info!(
            path = ?path,
            readers = readers.as_ref().map_or(0, ReaderPool::count),
            "async database started"
        );
        Ok(Self {
            writer,
            readers,
            schema,
            path,
        })
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of reader threads; 0 when reads share the writer.
    pub fn reader_count(&self) -> usize {
        self.readers.as_ref().map_or(0, ReaderPool::count)
    }

    /// True once the writer thread has stopped.
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Stops the readers and the writer. Queued requests finish first; the
    /// file lease is released once this returns.
    pub async fn shutdown(self) {
        if let Some(readers) = &self.readers {
            readers.shutdown().await;
        }
        if self.writer.shutdown().await.is_err() {
            debug!("writer already stopped");
        }
    }

    async fn read<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&Connection, &SchemaRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match &self.readers {
            Some(readers) => readers.call(job).await,
            None => self.writer.call(move |db| db.with_connection(job)).await,
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Runs `body` in one transaction on the writer thread. Failures come
    /// back as [`Error::TransactionAborted`](crate::Error::TransactionAborted).
    pub async fn run_atomically<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.writer.call(move |db| db.run_atomically(body)).await
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub async fn insert<E: Entity + Send>(&self, entity: E, policy: ConflictPolicy) -> Result<Option<i64>> {
        self.writer.call(move |db| db.insert(&entity, policy)).await
    }

    pub async fn insert_all<E: Entity + Send>(
        &self,
        entities: Vec<E>,
        policy: ConflictPolicy,
    ) -> Result<Vec<Option<i64>>> {
        self.writer.call(move |db| db.insert_all(&entities, policy)).await
    }

    pub async fn update<E: Entity + Send>(&self, entity: E) -> Result<usize> {
        self.writer.call(move |db| db.update(&entity)).await
    }

    pub async fn update_all<E: Entity + Send>(&self, entities: Vec<E>) -> Result<usize> {
        self.writer.call(move |db| db.update_all(&entities)).await
    }

    pub async fn delete<E: Entity + Send>(&self, entity: E) -> Result<usize> {
        self.writer.call(move |db| db.delete(&entity)).await
    }

    pub async fn delete_all<E: Entity + Send>(&self, entities: Vec<E>) -> Result<usize> {
        self.writer.call(move |db| db.delete_all(&entities)).await
    }

    /// Runs a registered write query.
    pub async fn execute(&self, query: impl Into<String>, args: Args) -> Result<usize> {
        let query = query.into();
        self.writer.call(move |db| db.execute(&query, &args)).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn find<E: Entity + Send>(&self, key: impl ToValue) -> Result<Option<E>> {
        let key = [key.to_value()?];
        self.read(move |conn, schema| transaction::find(conn, schema, &key)).await
    }

    pub async fn find_by_key<E: Entity + Send>(&self, key: Vec<Value>) -> Result<Option<E>> {
        self.read(move |conn, schema| transaction::find(conn, schema, &key)).await
    }

    pub async fn fetch_many<T: FromRow + Send>(&self, query: impl Into<String>, args: Args) -> Result<Vec<T>> {
        let query = query.into();
        self.read(move |conn, schema| transaction::fetch_many(conn, schema, &query, &args))
            .await
    }

    pub async fn fetch_one<T: FromRow + Send>(&self, query: impl Into<String>, args: Args) -> Result<Option<T>> {
        let query = query.into();
        self.read(move |conn, schema| transaction::fetch_one(conn, schema, &query, &args))
            .await
    }

    pub async fn fetch_value<V: FromValue + Send + 'static>(
        &self,
        query: impl Into<String>,
        args: Args,
    ) -> Result<Option<V>> {
        let query = query.into();
        self.read(move |conn, schema| transaction::fetch_value(conn, schema, &query, &args))
            .await
    }

    /// Parent rows with their relations resolved, read in one snapshot.
    pub async fn fetch_with_relations<P: FromRow + Send>(
        &self,
        query: impl Into<String>,
        args: Args,
        relations: Vec<String>,
    ) -> Result<Vec<Expanded<P>>> {
        let query = query.into();
        self.read(move |conn, schema| {
            let names: Vec<&str> = relations.iter().map(String::as_str).collect();
            relation::fetch_expanded(conn, schema, &query, &args, &names)
        })
        .await
    }

    // =========================================================================
    // Live Queries
    // =========================================================================
    //
    // Registration runs on the writer so the first value and every later
    // re-evaluation are ordered with respect to commits.

    pub async fn observe_many<T: FromRow + Send>(
        &self,
        query: impl Into<String>,
        args: Args,
    ) -> Result<LiveQuery<Vec<T>>> {
        let query = query.into();
        self.writer.call(move |db| db.observe_many(&query, &args)).await
    }

    pub async fn observe_one<T: FromRow + Send>(&self, query: impl Into<String>, args: Args) -> Result<LiveQuery<T>> {
        let query = query.into();
        self.writer.call(move |db| db.observe_one(&query, &args)).await
    }

    pub async fn observe_value<V: FromValue + Send + 'static>(
        &self,
        query: impl Into<String>,
        args: Args,
    ) -> Result<LiveQuery<V>> {
        let query = query.into();
        self.writer.call(move |db| db.observe_value(&query, &args)).await
    }

    /// Live queries not yet cancelled.
    pub async fn active_subscriptions(&self) -> Result<usize> {
        self.writer.call(|db| Ok(db.active_subscriptions())).await
    }
}

impl fmt::Debug for AsyncDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDatabase")
            .field("path", &self.path)
            .field("readers", &self.reader_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
