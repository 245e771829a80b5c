//! # Transaction Coordinator
//!
//! Every write runs inside exactly one engine transaction. A [`Tx`] is the
//! handle passed to transaction bodies: it exposes the entity commands,
//! registered queries and relation fetches, and records which tables the
//! body wrote so the Change Notifier can re-evaluate dependent queries after
//! commit.
//!
//! ## Transaction Flow
//!
//! ```text
//! run_atomically(body)
//!   │
//!   ├── BEGIN IMMEDIATE          (takes the write lock up front)
//!   ├── body(&mut tx)
//!   │     ├── tx.insert(..)      written += cascade closure; engine failure marks rollback-only
//!   │     ├── tx.run_atomically(inner)   joins; failure marks rollback-only
//!   │     └── ...
//!   ├── Ok and not rollback-only ──► COMMIT ──► notify(written)
//!   └── otherwise ─────────────────► ROLLBACK
//! ```
//!
//! Nested calls never open savepoints: an inner failure poisons the outer
//! transaction, which rolls back in full even if the outer body swallows the
//! inner error. Deferred foreign keys are checked at `COMMIT`; a failing check
//! leaves the engine transaction open, so it is rolled back explicitly.
//!
//! Raw `BEGIN`/`COMMIT`/`ROLLBACK` are used instead of `rusqlite::Transaction`
//! so a `Tx` can borrow the connection immutably alongside the registry.

use std::collections::BTreeSet;

use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mapper::{entity_to_params, row_to_entity, Entity, FromRow, FromValue, ToValue};
use crate::query::{compile, read_rows, Args, Cardinality};
use crate::relation::{self, Expanded};
use crate::schema::SchemaRegistry;
use crate::types::{ConflictPolicy, Value};

// =============================================================================
// Tx
// =============================================================================

/// Handle to the current transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
    schema: &'a SchemaRegistry,
    depth: usize,
    rollback_cause: Option<String>,
    written: BTreeSet<String>,
}

impl<'a> Tx<'a> {
    fn new(conn: &'a Connection, schema: &'a SchemaRegistry) -> Self {
        Self {
            conn,
            schema,
            depth: 0,
            rollback_cause: None,
            written: BTreeSet::new(),
        }
    }

    /// Nesting level; `0` inside the outermost body.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True once a nested body or a statement of this unit has failed.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_cause.is_some()
    }

    /// Tables written so far, including cascade targets.
    pub fn written_tables(&self) -> &BTreeSet<String> {
        &self.written
    }

    fn record_write(&mut self, table: &str) {
        self.written.extend(self.schema.affected_tables(table));
    }

    /// Marks the unit rollback-only when a statement failed in the engine.
    /// Errors raised before anything reached the engine leave it usable.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(e.root(), Error::ConstraintViolation { .. } | Error::Sqlite(_)) && self.rollback_cause.is_none()
            {
                debug!(error = %e, "statement failed; transaction is rollback-only");
                self.rollback_cause = Some(e.root().to_string());
            }
        }
        result
    }

    // =========================================================================
    // Nesting
    // =========================================================================

    /// Runs `body` as part of the current transaction.
    ///
    /// On failure the enclosing transaction is marked rollback-only and the
    /// error is returned as [`Error::TransactionAborted`].
    pub fn run_atomically<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Tx<'a>) -> Result<T>,
    {
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;

        result.map_err(|e| {
            if self.rollback_cause.is_none() {
                self.rollback_cause = Some(e.root().to_string());
            }
            debug!(depth = self.depth + 1, error = %e, "nested transaction failed");
            e.aborted()
        })
    }

    // =========================================================================
    // Entity Commands
    // =========================================================================

    /// Inserts one entity under `policy`.
    ///
    /// Returns the row id of the stored row, or `None` when `Ignore` dropped
    /// the write.
    pub fn insert<E: Entity>(&mut self, entity: &E, policy: ConflictPolicy) -> Result<Option<i64>> {
        let result = self.insert_row(entity, policy);
        self.guard(result)
    }

    fn insert_row<E: Entity>(&mut self, entity: &E, policy: ConflictPolicy) -> Result<Option<i64>> {
        let (desc, statements) = self.schema.statements::<E>()?;
        let params = entity_to_params(desc, entity)?;

        let mut stmt = self.conn.prepare_cached(statements.insert(policy))?;
        let changed = stmt.execute(params_from_iter(params.iter()))?;
        if changed == 0 {
            return Ok(None);
        }

        let table = desc.table().to_string();
        self.record_write(&table);
        Ok(Some(self.conn.last_insert_rowid()))
    }

    /// Inserts every entity in order; the first failure stops the batch.
    pub fn insert_all<E: Entity>(&mut self, entities: &[E], policy: ConflictPolicy) -> Result<Vec<Option<i64>>> {
        entities.iter().map(|e| self.insert(e, policy)).collect()
    }

    /// Updates the row with the entity's primary key. Returns rows changed
    /// (0 when no such row exists).
    pub fn update<E: Entity>(&mut self, entity: &E) -> Result<usize> {
        let result = self.update_row(entity);
        self.guard(result)
    }

    fn update_row<E: Entity>(&mut self, entity: &E) -> Result<usize> {
        let (desc, statements) = self.schema.statements::<E>()?;
        let values = entity_to_params(desc, entity)?;
        let params: Vec<&Value> = statements.update_params.iter().map(|&i| &values[i]).collect();

        let mut stmt = self.conn.prepare_cached(&statements.update)?;
        let changed = stmt.execute(params_from_iter(params))?;
        if changed > 0 {
            let table = desc.table().to_string();
            self.record_write(&table);
        }
        Ok(changed)
    }

    pub fn update_all<E: Entity>(&mut self, entities: &[E]) -> Result<usize> {
        let mut total = 0;
        for entity in entities {
            total += self.update(entity)?;
        }
        Ok(total)
    }

    /// Deletes the row with the entity's primary key. Returns rows deleted.
    pub fn delete<E: Entity>(&mut self, entity: &E) -> Result<usize> {
        let result = self.delete_row(entity);
        self.guard(result)
    }

    fn delete_row<E: Entity>(&mut self, entity: &E) -> Result<usize> {
        let (desc, statements) = self.schema.statements::<E>()?;
        let values = entity_to_params(desc, entity)?;
        let keys: Vec<&Value> = desc.key_positions().into_iter().map(|i| &values[i]).collect();

        let mut stmt = self.conn.prepare_cached(&statements.delete)?;
        let changed = stmt.execute(params_from_iter(keys))?;
        if changed > 0 {
            let table = desc.table().to_string();
            self.record_write(&table);
        }
        Ok(changed)
    }

    pub fn delete_all<E: Entity>(&mut self, entities: &[E]) -> Result<usize> {
        let mut total = 0;
        for entity in entities {
            total += self.delete(entity)?;
        }
        Ok(total)
    }

    /// Runs a registered write query. Returns the affected-row count.
    pub fn execute(&mut self, query: &str, args: &Args) -> Result<usize> {
        let result = self.execute_query(query, args);
        self.guard(result)
    }

    fn execute_query(&mut self, query: &str, args: &Args) -> Result<usize> {
        let descriptor = self.schema.query(query)?;
        descriptor.expect_affected()?;
        let statement = compile(descriptor, args)?;
        let changed = statement.execute(self.conn)?;

        if changed > 0 {
            let targets: Vec<String> = descriptor.writes().iter().cloned().collect();
            for table in targets {
                self.record_write(&table);
            }
        }
        Ok(changed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn find<E: Entity>(&self, key: impl ToValue) -> Result<Option<E>> {
        find(self.conn, self.schema, &[key.to_value()?])
    }

    /// Looks up an entity by a composite key, in primary-key order.
    pub fn find_by_key<E: Entity>(&self, key: &[Value]) -> Result<Option<E>> {
        find(self.conn, self.schema, key)
    }

    pub fn fetch_many<T: FromRow>(&self, query: &str, args: &Args) -> Result<Vec<T>> {
        fetch_many(self.conn, self.schema, query, args)
    }

    pub fn fetch_one<T: FromRow>(&self, query: &str, args: &Args) -> Result<Option<T>> {
        fetch_one(self.conn, self.schema, query, args)
    }

    pub fn fetch_value<V: FromValue>(&self, query: &str, args: &Args) -> Result<Option<V>> {
        fetch_value(self.conn, self.schema, query, args)
    }

    pub fn fetch_with_relations<P: FromRow>(
        &self,
        query: &str,
        args: &Args,
        relations: &[&str],
    ) -> Result<Vec<Expanded<P>>> {
        relation::fetch_expanded(self.conn, self.schema, query, args, relations)
    }
}

// =============================================================================
// Outer Transaction
// =============================================================================

/// Runs `body` in a new engine transaction.
///
/// Returns the body's value and the set of tables written. Errors are
/// returned as the body produced them; callers decide whether to wrap them.
pub(crate) fn run<T, F>(conn: &Connection, schema: &SchemaRegistry, body: F) -> Result<(T, BTreeSet<String>)>
where
    F: FnOnce(&mut Tx<'_>) -> Result<T>,
{
    if !conn.is_autocommit() {
        warn!("connection still inside a transaction; rolling it back");
        conn.execute_batch("ROLLBACK")?;
    }
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let mut tx = Tx::new(conn, schema);
    let outcome = body(&mut tx);

    let failure = match (outcome, tx.rollback_cause.take()) {
        (Ok(value), None) => match conn.execute_batch("COMMIT") {
            Ok(()) => {
                debug!(tables = ?tx.written, "transaction committed");
                return Ok((value, tx.written));
            }
            Err(e) => Error::from(e),
        },
        (Ok(_), Some(cause)) => Error::RollbackOnly(cause),
        (Err(e), _) => e,
    };

    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    debug!(error = %failure, "transaction rolled back");
    Err(failure)
}

// =============================================================================
// Shared Reads
// =============================================================================
//
// Used by `Tx`, the blocking handle and the reader pool alike.

pub(crate) fn find<E: Entity>(conn: &Connection, schema: &SchemaRegistry, key: &[Value]) -> Result<Option<E>> {
    let (desc, statements) = schema.statements::<E>()?;
    if key.len() != desc.primary_key().len() {
        return Err(Error::argument_mismatch(
            desc.table(),
            format!("expected {} key values, got {}", desc.primary_key().len(), key.len()),
        ));
    }
    let rows = read_rows(conn, &statements.select_by_key, key)?;
    rows.first().map(|row| row_to_entity::<E>(desc, row)).transpose()
}

pub(crate) fn fetch_many<T: FromRow>(
    conn: &Connection,
    schema: &SchemaRegistry,
    query: &str,
    args: &Args,
) -> Result<Vec<T>> {
    let descriptor = schema.query(query)?;
    descriptor.expect_rows::<T>(Cardinality::Many)?;
    let rows = compile(descriptor, args)?.query_rows(conn)?;
    rows.iter().map(T::from_row).collect()
}

pub(crate) fn fetch_one<T: FromRow>(
    conn: &Connection,
    schema: &SchemaRegistry,
    query: &str,
    args: &Args,
) -> Result<Option<T>> {
    let descriptor = schema.query(query)?;
    descriptor.expect_rows::<T>(Cardinality::One)?;
    let rows = compile(descriptor, args)?.query_rows(conn)?;
    rows.first().map(T::from_row).transpose()
}

pub(crate) fn fetch_value<V: FromValue>(
    conn: &Connection,
    schema: &SchemaRegistry,
    query: &str,
    args: &Args,
) -> Result<Option<V>> {
    let descriptor = schema.query(query)?;
    descriptor.expect_value()?;
    match compile(descriptor, args)?.query_value(conn)? {
        Some(Value::Null) | None => Ok(None),
        Some(value) => V::from_value(&value, query).map(Some),
    }
}

// =============================================================================
// Tests
// =============================================================================
