//! # Error Handling for SpiteORM
//!
//! This module defines the error type used throughout SpiteORM. A single enum
//! ([`Error`]) covers every failure mode, from schema registration through
//! statement compilation, row mapping, constraint enforcement and the async
//! worker boundary.
//!
//! ## Error Categories
//!
//! | Category | Variants | When |
//! |----------|----------|------|
//! | Registration | `InvalidSchema`, `DuplicateTable`, `UnknownEntity`, `SchemaVersion` | Before or during open, fatal to startup |
//! | Query/mapping | `ArgumentMismatch`, `ArgumentRange`, `ColumnMissing`, `ColumnCollision`, `TypeMismatch` | Surfaced to the caller, no partial effect |
//! | Write | `ConstraintViolation` | Only under `ConflictPolicy::Abort` (or FK actions) |
//! | Transaction | `TransactionAborted`, `RollbackOnly` | Any inner failure of `run_atomically` |
//! | Internal | `Sqlite`, `WorkerClosed` | Engine or worker failures |
//!
//! ## Engine Errors
//!
//! `rusqlite` reports every failure as one error type. Constraint failures
//! are peeled off into [`Error::ConstraintViolation`] in the `From` impl so
//! callers can match on the constraint kind without touching SQLite result
//! codes.

use std::fmt;

use rusqlite::ffi;
use thiserror::Error;

// =============================================================================
// Constraint Kinds
// =============================================================================

/// Which engine constraint rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Primary-key collision.
    PrimaryKey,
    /// Unique index collision.
    Unique,
    /// Foreign-key check failed (immediate, deferred at commit, or RESTRICT).
    ForeignKey,
    /// NULL written into a NOT NULL column.
    NotNull,
    /// CHECK constraint failed.
    Check,
    /// Any other constraint the engine reports.
    Other,
}

impl ConstraintKind {
    fn from_extended_code(code: i32) -> Self {
        match code {
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Self::PrimaryKey,
            ffi::SQLITE_CONSTRAINT_UNIQUE => Self::Unique,
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Self::ForeignKey,
            ffi::SQLITE_CONSTRAINT_NOTNULL => Self::NotNull,
            ffi::SQLITE_CONSTRAINT_CHECK => Self::Check,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrimaryKey => "primary key",
            Self::Unique => "unique",
            Self::ForeignKey => "foreign key",
            Self::NotNull => "not null",
            Self::Check => "check",
            Self::Other => "constraint",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteORM operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Registration Errors (fatal to startup)
    // =========================================================================

    /// An entity, query or relation declaration is malformed.
    ///
    /// # When This Happens
    ///
    /// - No primary key declared
    /// - A key, index or foreign-key column is not a declared column
    /// - A foreign key references a table that is not registered
    /// - A query fails to prepare against the engine at open
    #[error("invalid schema for '{table}': {reason}")]
    InvalidSchema {
        /// Table, query or relation the declaration belongs to
        table: String,
        /// What is wrong with it
        reason: String,
    },

    /// Two entities declared the same table name.
    #[error("table '{0}' is already registered")]
    DuplicateTable(String),

    /// No entity is registered for the requested type or table.
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    /// No query is registered under the requested name.
    #[error("unknown query '{0}'")]
    UnknownQuery(String),

    /// No relation is registered under the requested name.
    #[error("unknown relation '{0}'")]
    UnknownRelation(String),

    /// The database file was created with a different schema version.
    ///
    /// Migrations are out of scope; the caller must recreate the file or
    /// open it with the matching schema.
    #[error("schema version mismatch: database has version {found}, registry declares {expected}")]
    SchemaVersion {
        /// Version declared by the registry
        expected: u32,
        /// Version stored in the database file
        found: u32,
    },

    // =========================================================================
    // Query / Mapping Errors (operation aborted, no partial effect)
    // =========================================================================

    /// Placeholders and bound arguments do not line up.
    #[error("argument mismatch in '{query}': {reason}")]
    ArgumentMismatch {
        /// Query being compiled
        query: String,
        /// Which placeholder or argument is at fault
        reason: String,
    },

    /// A numeric value does not fit the target width.
    ///
    /// Raised both when binding (e.g. `u64` above `i64::MAX`) and when reading
    /// a stored integer into a narrower field. Values are never truncated.
    #[error("value {value} for '{name}' is out of range for {target}")]
    ArgumentRange {
        /// Argument or column name
        name: String,
        /// The offending value, rendered
        value: String,
        /// Target type name
        target: &'static str,
    },

    /// A required (non-nullable) column is absent from a query's result set.
    ///
    /// Checked once per query when the database opens, never per row.
    #[error("query '{query}' does not return required column '{column}'")]
    ColumnMissing {
        /// Query whose result set is incomplete
        query: String,
        /// The missing column
        column: String,
    },

    /// Two columns flatten to the same name without a disambiguating prefix.
    #[error("column '{column}' collides in '{table}'; add an embedded prefix")]
    ColumnCollision {
        /// Entity being registered
        table: String,
        /// The colliding flattened column name
        column: String,
    },

    /// A stored value has a different storage class than the field expects.
    #[error("column '{column}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Column being read
        column: String,
        /// Rust-side expectation
        expected: &'static str,
        /// Storage class actually found
        found: &'static str,
    },

    /// A query was called with a result type or shape it was not declared with.
    #[error("query '{query}' was declared as {declared}, called as {requested}")]
    ShapeMismatch {
        /// Query name
        query: String,
        /// Declared shape
        declared: String,
        /// Shape requested at the call site
        requested: String,
    },

    // =========================================================================
    // Write Errors
    // =========================================================================

    /// The engine rejected a write because of a constraint.
    ///
    /// Under `ConflictPolicy::Replace` and `ConflictPolicy::Ignore` key
    /// collisions are resolved by the engine and never surface here.
    #[error("{kind} constraint violated: {message}")]
    ConstraintViolation {
        /// Which constraint failed
        kind: ConstraintKind,
        /// Engine message
        message: String,
    },

    // =========================================================================
    // Transaction Errors
    // =========================================================================

    /// An operation inside `run_atomically` failed; every effect since the
    /// outermost begin has been rolled back.
    #[error("transaction aborted: {source}")]
    TransactionAborted {
        /// The first failure
        #[source]
        source: Box<Error>,
    },

    /// A nested `run_atomically` failed and the outer body carried on anyway;
    /// the whole transaction was rolled back at the outer boundary.
    #[error("transaction marked rollback-only by an earlier failure: {0}")]
    RollbackOnly(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================

    /// Any other SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// The database file is already held by a live handle in this process.
    #[error("database '{0}' is already open in this process")]
    AlreadyOpen(String),

    /// A worker thread of the async handle has shut down.
    #[error("worker closed: {0}")]
    WorkerClosed(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid_schema(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn argument_mismatch(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ArgumentMismatch {
            query: query.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a failure from inside a transaction body.
    ///
    /// Already-wrapped errors are passed through so nested bodies do not
    /// produce `aborted: aborted: ...` chains.
    pub(crate) fn aborted(self) -> Self {
        match self {
            Self::TransactionAborted { .. } => self,
            other => Self::TransactionAborted {
                source: Box::new(other),
            },
        }
    }

    /// Returns the underlying failure, looking through `TransactionAborted`.
    pub fn root(&self) -> &Error {
        match self {
            Self::TransactionAborted { source } => source.root(),
            other => other,
        }
    }

    /// Returns the constraint kind if this error (or its root) is a
    /// constraint violation.
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self.root() {
            Self::ConstraintViolation { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation {
                    kind: ConstraintKind::from_extended_code(code.extended_code),
                    message: message.unwrap_or_else(|| code.to_string()),
                }
            }
            other => Self::Sqlite(other),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
