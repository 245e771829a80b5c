//! # Database Handle
//!
//! [`Database`] is the blocking entry point: it owns the connection that
//! performs every write, the frozen [`SchemaRegistry`] and the
//! [`ChangeNotifier`]. [`AsyncDatabase`](crate::AsyncDatabase) moves one of
//! these onto a dedicated writer thread.
//!
//! ## Opening
//!
//! ```text
//! open(path, registry, config)
//!   1. lease the file           (second open in-process ──► AlreadyOpen)
//!   2. open connection, apply pragmas (foreign_keys, WAL, synchronous)
//!   3. create tables + indices, check recorded schema version
//!   4. prepare every registered query and relation, check result coverage
//! ```
//!
//! Any failure aborts the open and releases the lease.
//!
//! ## Configuration
//!
//! [`DatabaseConfig`] has code defaults and can be overridden from the
//! environment with [`DatabaseConfig::from_env`]:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `SPITEORM_READER_THREADS` | `reader_threads` | available CPUs, 2..=8 |
//! | `SPITEORM_BUSY_TIMEOUT_MS` | `busy_timeout` | 5000 |
//! | `SPITEORM_SYNCHRONOUS` | `synchronous` | `NORMAL` |
//! | `SPITEORM_STATEMENT_CACHE` | `statement_cache_capacity` | 64 |

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::thread::available_parallelism;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mapper::{Entity, FromRow, FromValue, ToValue};
use crate::query::Args;
use crate::relation::{self, Expanded};
use crate::schema::{install, Pragmas, SchemaRegistry};
use crate::subscription::{ChangeNotifier, LiveQuery};
use crate::transaction::{self, Tx};
use crate::types::{ConflictPolicy, Value};

// =============================================================================
// Configuration
// =============================================================================

/// Minimum number of reader threads.
pub const MIN_READ_THREADS: usize = 2;

/// Maximum number of reader threads.
pub const MAX_READ_THREADS: usize = 8;

/// Default busy timeout for every connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default per-connection prepared statement cache size.
pub const DEFAULT_STATEMENT_CACHE: usize = 64;

/// `PRAGMA synchronous` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Synchronous {
    Off,
    #[default]
    Normal,
    Full,
}

impl Synchronous {
    fn pragma(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

impl FromStr for Synchronous {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" | "0" => Ok(Self::Off),
            "NORMAL" | "1" => Ok(Self::Normal),
            "FULL" | "2" => Ok(Self::Full),
            other => Err(Error::Config(format!("unknown synchronous level '{other}'"))),
        }
    }
}

impl fmt::Display for Synchronous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pragma())
    }
}

/// Connection and pool settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Read-only connections in the async reader pool. `0` routes reads to
    /// the writer. Ignored for in-memory databases.
    pub reader_threads: usize,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub synchronous: Synchronous,
    /// Prepared statements cached per connection.
    pub statement_cache_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            reader_threads: available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_READ_THREADS)
                .clamp(MIN_READ_THREADS, MAX_READ_THREADS),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            synchronous: Synchronous::default(),
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE,
        }
    }
}

impl DatabaseConfig {
    /// Defaults overridden by `SPITEORM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("SPITEORM_READER_THREADS") {
            config.reader_threads = parse_number(&v, "SPITEORM_READER_THREADS")?;
        }
        if let Some(v) = lookup("SPITEORM_BUSY_TIMEOUT_MS") {
            config.busy_timeout = Duration::from_millis(parse_number(&v, "SPITEORM_BUSY_TIMEOUT_MS")?);
        }
        if let Some(v) = lookup("SPITEORM_SYNCHRONOUS") {
            config.synchronous = v.parse()?;
        }
        if let Some(v) = lookup("SPITEORM_STATEMENT_CACHE") {
            config.statement_cache_capacity = parse_number(&v, "SPITEORM_STATEMENT_CACHE")?;
        }
        Ok(config)
    }

    pub fn with_reader_threads(mut self, n: usize) -> Self {
        self.reader_threads = n;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_synchronous(mut self, level: Synchronous) -> Self {
        self.synchronous = level;
        self
    }

    /// Applies per-connection settings shared by the writer and readers.
    pub(crate) fn configure(&self, conn: &Connection) -> Result<()> {
        conn.busy_timeout(self.busy_timeout)?;
        conn.set_prepared_statement_cache_capacity(self.statement_cache_capacity);
        Ok(())
    }
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: '{value}' is not a valid number")))
}

// =============================================================================
// File Lease
// =============================================================================

static OPEN_FILES: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Process-wide claim on a database file, released on drop.
#[derive(Debug)]
struct FileLease {
    path: PathBuf,
}

impl FileLease {
    fn acquire(path: &Path) -> Result<Self> {
        let path = normalize(path);
        let mut open = OPEN_FILES.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(path.clone()) {
            return Err(Error::AlreadyOpen(path.display().to_string()));
        }
        Ok(Self { path })
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        let mut open = OPEN_FILES.lock().unwrap_or_else(PoisonError::into_inner);
        open.remove(&self.path);
    }
}

/// Resolves a path that may not exist yet through its parent directory.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

// =============================================================================
// Database
// =============================================================================

/// Blocking handle to an open database.
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open("roster.db", schema)?;
/// db.insert(&Employee::new("Ann", 120), ConflictPolicy::Abort)?;
/// let rich: Vec<Employee> = db.fetch_many("employee.salary_above", &Args::new().bind("min", 100))?;
/// ```
pub struct Database {
    conn: Connection,
    schema: Arc<SchemaRegistry>,
    notifier: ChangeNotifier,
    config: DatabaseConfig,
    path: Option<PathBuf>,
    _lease: Option<FileLease>,
}

impl Database {
    /// Opens (or creates) a file database with default configuration.
    pub fn open(path: impl AsRef<Path>, schema: SchemaRegistry) -> Result<Self> {
        Self::open_with_config(path, schema, DatabaseConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, schema: SchemaRegistry, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();
        let lease = FileLease::acquire(path)?;
        let conn = Connection::open(path)?;
        let db = Self::initialize(conn, schema, config, Some(lease))?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// Opens a private in-memory database, for tests and scratch use.
    pub fn open_in_memory(schema: SchemaRegistry) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, schema, DatabaseConfig::default(), None)
    }

    fn initialize(
        conn: Connection,
        schema: SchemaRegistry,
        config: DatabaseConfig,
        lease: Option<FileLease>,
    ) -> Result<Self> {
        config.configure(&conn)?;
        install(
            &conn,
            &schema,
            Pragmas {
                wal: lease.is_some(),
                synchronous: config.synchronous.pragma(),
            },
        )?;
        Ok(Self {
            conn,
            schema: Arc::new(schema),
            notifier: ChangeNotifier::new(),
            config,
            path: lease.as_ref().map(|l| l.path.clone()),
            _lease: lease,
        })
    }

    /// Opens a read-only connection to the same file, configured like the
    /// writer. `None` for in-memory databases.
    pub(crate) fn open_reader(&self) -> Result<Option<Connection>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        self.config.configure(&conn)?;
        Ok(Some(conn))
    }

    /// Lends the write connection to a read job. Used when no reader pool
    /// exists.
    pub(crate) fn with_connection<T>(&self, job: impl FnOnce(&Connection, &SchemaRegistry) -> T) -> T {
        job(&self.conn, &self.schema)
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub(crate) fn shared_schema(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.schema)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// File path, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Runs `body` in one transaction. All of its writes commit together or
    /// none do; any failure is returned as [`Error::TransactionAborted`].
    pub fn run_atomically<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        self.write(body).map_err(Error::aborted)
    }

    /// Single-command transactions; errors are returned unwrapped.
    fn write<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T>,
    {
        let (value, written) = transaction::run(&self.conn, &self.schema, body)?;
        self.notifier.on_commit(&self.conn, &written);
        Ok(value)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub fn insert<E: Entity>(&mut self, entity: &E, policy: ConflictPolicy) -> Result<Option<i64>> {
        self.write(|tx| tx.insert(entity, policy))
    }

    /// Inserts all entities in one transaction.
    pub fn insert_all<E: Entity>(&mut self, entities: &[E], policy: ConflictPolicy) -> Result<Vec<Option<i64>>> {
        self.write(|tx| tx.insert_all(entities, policy))
    }

    pub fn update<E: Entity>(&mut self, entity: &E) -> Result<usize> {
        self.write(|tx| tx.update(entity))
    }

    pub fn update_all<E: Entity>(&mut self, entities: &[E]) -> Result<usize> {
        self.write(|tx| tx.update_all(entities))
    }

    pub fn delete<E: Entity>(&mut self, entity: &E) -> Result<usize> {
        self.write(|tx| tx.delete(entity))
    }

    pub fn delete_all<E: Entity>(&mut self, entities: &[E]) -> Result<usize> {
        self.write(|tx| tx.delete_all(entities))
    }

    /// Runs a registered write query.
    pub fn execute(&mut self, query: &str, args: &Args) -> Result<usize> {
        self.write(|tx| tx.execute(query, args))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn find<E: Entity>(&self, key: impl ToValue) -> Result<Option<E>> {
        transaction::find(&self.conn, &self.schema, &[key.to_value()?])
    }

    pub fn find_by_key<E: Entity>(&self, key: &[Value]) -> Result<Option<E>> {
        transaction::find(&self.conn, &self.schema, key)
    }

    pub fn fetch_many<T: FromRow>(&self, query: &str, args: &Args) -> Result<Vec<T>> {
        transaction::fetch_many(&self.conn, &self.schema, query, args)
    }

    pub fn fetch_one<T: FromRow>(&self, query: &str, args: &Args) -> Result<Option<T>> {
        transaction::fetch_one(&self.conn, &self.schema, query, args)
    }

    pub fn fetch_value<V: FromValue>(&self, query: &str, args: &Args) -> Result<Option<V>> {
        transaction::fetch_value(&self.conn, &self.schema, query, args)
    }

    /// Runs a parent query and attaches the named relations to each parent.
    pub fn fetch_with_relations<P: FromRow>(
        &self,
        query: &str,
        args: &Args,
        relations: &[&str],
    ) -> Result<Vec<Expanded<P>>> {
        relation::fetch_expanded(&self.conn, &self.schema, query, args, relations)
    }

    /// Typed shorthand for a single relation.
    pub fn fetch_with_children<P: FromRow, C: FromRow>(
        &self,
        query: &str,
        args: &Args,
        relation: &str,
    ) -> Result<Vec<(P, Vec<C>)>> {
        self.fetch_with_relations::<P>(query, args, &[relation])?
            .into_iter()
            .map(|e| {
                let children = e.children::<C>(relation)?;
                Ok((e.into_parent(), children))
            })
            .collect()
    }

    // =========================================================================
    // Live Queries
    // =========================================================================

    pub fn observe_many<T: FromRow>(&mut self, query: &str, args: &Args) -> Result<LiveQuery<Vec<T>>> {
        self.notifier.observe_many(&self.conn, &self.schema, query, args)
    }

    pub fn observe_one<T: FromRow>(&mut self, query: &str, args: &Args) -> Result<LiveQuery<T>> {
        self.notifier.observe_one(&self.conn, &self.schema, query, args)
    }

    pub fn observe_value<V: FromValue>(&mut self, query: &str, args: &Args) -> Result<LiveQuery<V>> {
        self.notifier.observe_value(&self.conn, &self.schema, query, args)
    }

    /// Live queries not yet cancelled.
    pub fn active_subscriptions(&self) -> usize {
        self.notifier.active()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        debug!(path = ?self.path, "database closed");
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("version", &self.schema.version())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SPITEORM_READER_THREADS", "3"),
            ("SPITEORM_BUSY_TIMEOUT_MS", "250"),
            ("SPITEORM_SYNCHRONOUS", "full"),
        ]
        .into_iter()
        .collect();
        let config = DatabaseConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.reader_threads, 3);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.synchronous, Synchronous::Full);
        assert_eq!(config.statement_cache_capacity, DEFAULT_STATEMENT_CACHE);
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = DatabaseConfig::from_lookup(|k| (k == "SPITEORM_READER_THREADS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = DatabaseConfig::from_lookup(|k| (k == "SPITEORM_SYNCHRONOUS").then(|| "sometimes".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_default_reader_threads_clamped() {
        let config = DatabaseConfig::default();
        assert!((MIN_READ_THREADS..=MAX_READ_THREADS).contains(&config.reader_threads));
    }

    #[test]
    fn test_second_open_is_rejected_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.db");

        let first = Database::open(&path, SchemaRegistry::new(1)).unwrap();
        let err = Database::open(&path, SchemaRegistry::new(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen(_)));

        drop(first);
        Database::open(&path, SchemaRegistry::new(1)).unwrap();
    }

    #[test]
    fn test_failed_open_releases_lease() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.db");

        drop(Database::open(&path, SchemaRegistry::new(1)).unwrap());
        assert!(matches!(
            Database::open(&path, SchemaRegistry::new(2)),
            Err(Error::SchemaVersion { .. })
        ));
        Database::open(&path, SchemaRegistry::new(1)).unwrap();
    }

    #[test]
    fn test_in_memory_has_no_reader() {
        let db = Database::open_in_memory(SchemaRegistry::new(1)).unwrap();
        assert!(db.path().is_none());
        assert!(db.open_reader().unwrap().is_none());
    }
}
