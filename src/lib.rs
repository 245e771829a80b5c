//! # SpiteORM - Embedded Relational Persistence
//!
//! SpiteORM maps application types onto tables in an embedded SQLite file.
//! It provides:
//!
//! - **Declared schema**: entities, embedded groups, keys, foreign keys and
//!   indices, validated once and frozen before the database opens
//! - **Named queries**: SQL with `:name` placeholders, list expansion for
//!   `IN (...)` and result shapes checked when the database opens
//! - **Atomic units of work**: nested units join the outer transaction
//! - **Relations**: one-to-many children fetched in one batched query
//! - **Live queries**: results re-delivered after every commit that touches
//!   their tables
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 AsyncDatabase  /  Database                      │
//! │        (commands, reads, run_atomically, observe_*)             │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │ writes                       │ reads
//!                ▼                              ▼
//! ┌──────────────────────────────┐  ┌───────────────────────────────┐
//! │ Writer (one thread)          │  │ Reader pool (async only)      │
//! │  Tx ─► Statement Compiler    │  │  Statement Compiler ─► Mapper │
//! │  commit ─► Change Notifier   │  │  Relation Resolver            │
//! └──────────────┬───────────────┘  └───────────────┬───────────────┘
//!                └──────────────┬───────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  SQLite (WAL, foreign keys on)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Frozen schema**: the registry is immutable once a database is open
//! 2. **All or nothing**: a unit of work either commits every write or none
//! 3. **Checked binding**: every placeholder is bound exactly once, every
//!    argument is used
//! 4. **Fresh live results**: after a commit, each affected live query
//!    delivers a value at least as new as that commit, never an older one
//!
//! ## Module Organization
//!
//! - [`types`]: values, rows, column types, conflict policies
//! - [`error`]: error enum and constraint classification
//! - [`schema`]: Schema Registry, DDL and installation
//! - [`mapper`]: conversions between rows and application types
//! - [`query`]: query descriptors and the Statement Compiler
//! - [`transaction`]: the Transaction Coordinator
//! - [`relation`]: the Relation Resolver
//! - [`subscription`]: live queries and the Change Notifier
//! - [`database`]: the blocking handle and configuration
//! - [`api`]: the async handle

// =============================================================================
// Module Declarations
// =============================================================================

pub mod types;

/// Error types. One enum covers every failure the crate reports.
pub mod error;

/// Entity declarations, the registry that freezes them, and the DDL that
/// installs them.
pub mod schema;

pub mod mapper;

/// Named queries and compilation of `:name` placeholders into positional
/// statements.
pub mod query;

pub mod transaction;

pub mod relation;

/// Live queries and commit-driven re-evaluation.
pub mod subscription;

pub mod database;

/// Async handle backed by a writer thread and a reader pool.
pub mod api;

mod reader;
mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::AsyncDatabase;
pub use database::{Database, DatabaseConfig, Synchronous};
pub use error::{ConstraintKind, Error, Result};
pub use mapper::{Entity, FromRow, FromValue, RowShape, ToValue};
pub use query::{Args, Cardinality, QueryDescriptor, ResultShape};
pub use relation::{Expanded, RelationSpec};
pub use schema::{ColumnDef, EmbeddedDef, ForeignKeyDescriptor, IndexDescriptor, SchemaRegistry, TableDef};
pub use subscription::{CancelHandle, LiveQuery, LiveResult};
pub use transaction::Tx;
pub use types::{ConflictPolicy, ForeignKeyAction, Row, SqlType, Value};
