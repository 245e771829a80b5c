//! # Relation Resolver
//!
//! Attaches one-to-many children to parent rows without issuing one query per
//! parent. Parent rows come from a registered query; for each requested
//! relation the resolver collects the distinct parent keys, fetches all
//! matching children with `IN (...)` batches, and partitions them back by
//! foreign-key value.
//!
//! ```text
//! parents: dept 1, dept 2, dept 7
//!                  │
//!                  ▼
//! SELECT * FROM employee WHERE department_id IN (1, 2, 7) ORDER BY rowid
//!                  │
//!                  ▼
//! { 1: [ann, bob], 2: [cy], 7: [] }
//! ```
//!
//! Key batches are capped at [`MAX_BOUND_PARAMS`] so large parent sets stay
//! under the engine's bound-variable limit. The parent query and every child
//! batch run inside one read transaction, so children always match the
//! parents they are attached to.

use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::Connection;
use tracing::trace;

use crate::error::{Error, Result};
use crate::mapper::FromRow;
use crate::query::{compile, read_rows, Args, Cardinality};
use crate::schema::SchemaRegistry;
use crate::types::{quote_ident, Row, Value};

/// Upper bound on keys bound into one child fetch.
pub const MAX_BOUND_PARAMS: usize = 999;

// =============================================================================
// Relation Spec
// =============================================================================

/// A named one-to-many relation from a parent table to a child table.
///
/// # Example
///
/// ```rust,ignore
/// schema.register_relation(
///     RelationSpec::new("department.employees", "department", "id", "employee", "department_id"),
/// )?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    name: String,
    parent_table: String,
    parent_column: String,
    child_table: String,
    child_column: String,
    projection: Option<Vec<String>>,
}

impl RelationSpec {
    pub fn new(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
        child_table: impl Into<String>,
        child_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
            child_table: child_table.into(),
            child_column: child_column.into(),
            projection: None,
        }
    }

    /// Restricts fetched child columns. Must include the child column.
    pub fn project<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_table(&self) -> &str {
        &self.parent_table
    }

    pub fn parent_column(&self) -> &str {
        &self.parent_column
    }

    pub fn child_table(&self) -> &str {
        &self.child_table
    }

    pub fn child_column(&self) -> &str {
        &self.child_column
    }

    pub(crate) fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        let invalid = |reason: String| Error::invalid_schema(&self.name, reason);

        let parent = registry
            .resolve_table(&self.parent_table)
            .map_err(|_| invalid(format!("parent table '{}' is not registered", self.parent_table)))?;
        if !parent.has_column(&self.parent_column) {
            return Err(invalid(format!(
                "parent column '{}.{}' is not declared",
                self.parent_table, self.parent_column
            )));
        }

        let child = registry
            .resolve_table(&self.child_table)
            .map_err(|_| invalid(format!("child table '{}' is not registered", self.child_table)))?;
        if !child.has_column(&self.child_column) {
            return Err(invalid(format!(
                "child column '{}.{}' is not declared",
                self.child_table, self.child_column
            )));
        }

        if let Some(projection) = &self.projection {
            for column in projection {
                if !child.has_column(column) {
                    return Err(invalid(format!("projected column '{column}' is not declared")));
                }
            }
            if !projection.iter().any(|c| c.eq_ignore_ascii_case(&self.child_column)) {
                return Err(invalid(format!(
                    "projection must include the child column '{}'",
                    self.child_column
                )));
            }
        }
        Ok(())
    }

    /// Child fetch for `keys` parent keys.
    pub(crate) fn child_sql(&self, registry: &SchemaRegistry, keys: usize) -> Result<String> {
        let child = registry.resolve_table(&self.child_table)?;
        let columns: Vec<String> = match &self.projection {
            Some(projection) => projection.iter().map(|c| quote_ident(c)).collect(),
            None => child.columns().iter().map(|c| quote_ident(&c.column)).collect(),
        };
        let slots = vec!["?"; keys];
        Ok(format!(
            "SELECT {} FROM {} WHERE {} IN ({}) ORDER BY rowid",
            columns.join(", "),
            quote_ident(child.table()),
            quote_ident(&self.child_column),
            slots.join(", ")
        ))
    }
}

// =============================================================================
// Expanded Results
// =============================================================================

/// A parent record with its related child rows attached.
#[derive(Debug, Clone)]
pub struct Expanded<P> {
    pub parent: P,
    children: BTreeMap<String, Vec<Row>>,
}

impl<P> Expanded<P> {
    /// Child rows for `relation`, in child insertion order. Empty for a
    /// relation that was not requested.
    pub fn rows(&self, relation: &str) -> &[Row] {
        self.children.get(relation).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Decodes the child rows of `relation` as `C`.
    pub fn children<C: FromRow>(&self, relation: &str) -> Result<Vec<C>> {
        self.rows(relation).iter().map(C::from_row).collect()
    }

    pub fn into_parent(self) -> P {
        self.parent
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Runs the registered parent query `query` and attaches every relation in
/// `relations` to each parent.
pub(crate) fn fetch_expanded<P: FromRow>(
    conn: &Connection,
    registry: &SchemaRegistry,
    query: &str,
    args: &Args,
    relations: &[&str],
) -> Result<Vec<Expanded<P>>> {
    let descriptor = registry.query(query)?;
    descriptor.expect_rows::<P>(Cardinality::Many)?;
    let specs = relations
        .iter()
        .map(|name| registry.relation(name))
        .collect::<Result<Vec<_>>>()?;
    let statement = compile(descriptor, args)?;

    let own_transaction = conn.is_autocommit();
    if own_transaction {
        conn.execute_batch("BEGIN")?;
    }
    let result = (|| -> Result<Vec<Expanded<P>>> {
        let parents = statement.query_rows(conn)?;

        let mut per_relation = Vec::with_capacity(specs.len());
        for spec in &specs {
            per_relation.push(resolve(conn, registry, spec, &parents)?);
        }

        let mut out = Vec::with_capacity(parents.len());
        for (i, row) in parents.iter().enumerate() {
            let mut children = BTreeMap::new();
            for (spec, groups) in specs.iter().zip(per_relation.iter_mut()) {
                children.insert(spec.name().to_string(), std::mem::take(&mut groups[i]));
            }
            out.push(Expanded {
                parent: P::from_row(row)?,
                children,
            });
        }
        Ok(out)
    })();
    if own_transaction {
        conn.execute_batch("COMMIT")?;
    }
    result
}

/// Fetches the children of `spec` for every parent row, returned in parent
/// order.
pub(crate) fn resolve(
    conn: &Connection,
    registry: &SchemaRegistry,
    spec: &RelationSpec,
    parents: &[Row],
) -> Result<Vec<Vec<Row>>> {
    let mut keys = Vec::with_capacity(parents.len());
    for row in parents {
        let key = row.value(spec.parent_column()).ok_or_else(|| Error::ColumnMissing {
            query: spec.name().to_string(),
            column: spec.parent_column().to_string(),
        })?;
        keys.push(key.clone());
    }

    let mut distinct = Vec::new();
    let mut seen = HashSet::new();
    for key in &keys {
        if !key.is_null() && seen.insert(key.clone()) {
            distinct.push(key.clone());
        }
    }

    let mut groups: HashMap<Value, Vec<Row>> = HashMap::new();
    for chunk in distinct.chunks(MAX_BOUND_PARAMS) {
        let sql = spec.child_sql(registry, chunk.len())?;
        let rows = read_rows(conn, &sql, chunk)?;
        trace!(relation = spec.name(), keys = chunk.len(), rows = rows.len(), "fetched children");
        for row in rows {
            let key = row.value(spec.child_column()).cloned().unwrap_or(Value::Null);
            groups.entry(key).or_default().push(row);
        }
    }

    Ok(keys
        .iter()
        .map(|key| {
            if key.is_null() {
                Vec::new()
            } else {
                groups.get(key).cloned().unwrap_or_default()
            }
        })
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
