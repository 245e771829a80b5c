//! # Core Value Types for SpiteORM
//!
//! This module defines the engine-neutral data model the rest of the crate
//! works with:
//!
//! - [`Value`]: one dynamically-typed cell (`NULL`, integer, real, text, blob)
//! - [`Row`]: an ordered, named sequence of values returned by the engine
//! - [`SqlType`]: the declared storage class of a column
//! - [`ConflictPolicy`] and [`ForeignKeyAction`]: write-time policies
//!
//! ## Equality
//!
//! The Change Notifier decides whether to redeliver a live query by comparing
//! the new result set with the last delivered one. That requires total
//! equality on [`Value`], including reals, so `Real` compares by bit pattern
//! (`NaN == NaN`, `0.0 != -0.0`). The same rule makes `Value` usable as a hash
//! key when partitioning child rows by foreign key.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;

// =============================================================================
// Value
// =============================================================================

/// A single engine value.
#[derive(Debug, Clone)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer, the engine's native integer width.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Storage class name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Real(_) => "REAL",
            Self::Text(_) => "TEXT",
            Self::Blob(_) => "BLOB",
        }
    }

    /// Returns true for `Value::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub(crate) fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(r) => Self::Real(r),
            ValueRef::Text(t) => Self::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Self::Blob(b.to_vec()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Integer(i) => i.hash(state),
            Self::Real(r) => r.to_bits().hash(state),
            Self::Text(t) => t.hash(state),
            Self::Blob(b) => b.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(t) => write!(f, "'{t}'"),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Self::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Self::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

// =============================================================================
// Row
// =============================================================================

/// One result row: column names (shared across the whole result set) and
/// the values in result-column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row. `values` must be in the same order as `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Builds a row from `(column, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self {
            columns: columns.into(),
            values,
        }
    }

    /// Column names in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in result order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the value of a column, or `None` if the result set does not
    /// contain it. Column names compare ASCII case-insensitively, as SQL does.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| &self.values[i])
    }

    /// Returns true if the result set contains `column`.
    pub fn contains(&self, column: &str) -> bool {
        self.value(column).is_some()
    }
}

// =============================================================================
// Column Types
// =============================================================================

/// Declared storage class of a column.
///
/// Booleans are stored as `INTEGER` 0/1 and timestamps as whatever the
/// entity chooses (usually `INTEGER` milliseconds), so four classes suffice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Integer,
    Real,
    Text,
    Blob,
}

impl SqlType {
    /// The type name used in `CREATE TABLE`.
    pub fn ddl(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

// =============================================================================
// Write Policies
// =============================================================================

/// Resolution for primary-key or unique-index collisions on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConflictPolicy {
    /// Reject the write and roll back the enclosing transaction.
    #[default]
    Abort,
    /// Delete the colliding row, then insert.
    Replace,
    /// Keep the existing row and silently drop the incoming one.
    Ignore,
}

impl ConflictPolicy {
    /// The `INSERT` verb for this policy.
    pub(crate) fn insert_verb(&self) -> &'static str {
        match self {
            Self::Abort | Self::Ignore => "INSERT INTO",
            Self::Replace => "INSERT OR REPLACE INTO",
        }
    }

    /// Clause appended after `VALUES (..)`.
    ///
    /// `Ignore` uses an upsert clause rather than `OR IGNORE`, which would
    /// also swallow NOT NULL and CHECK failures.
    pub(crate) fn insert_suffix(&self) -> &'static str {
        match self {
            Self::Ignore => " ON CONFLICT DO NOTHING",
            Self::Abort | Self::Replace => "",
        }
    }

    pub(crate) const ALL: [ConflictPolicy; 3] = [Self::Abort, Self::Replace, Self::Ignore];

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Abort => 0,
            Self::Replace => 1,
            Self::Ignore => 2,
        }
    }
}

/// Action taken on referencing rows when a referenced key is deleted or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForeignKeyAction {
    /// Check the constraint (at statement end, or at commit when deferred).
    #[default]
    NoAction,
    /// Propagate the delete/update to the referencing rows.
    Cascade,
    /// Reject the change immediately, even when the key is deferred.
    Restrict,
    /// Set the referencing column to `NULL`.
    SetNull,
}

impl ForeignKeyAction {
    pub(crate) fn ddl(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
        }
    }

    /// Whether this action writes to the referencing table.
    pub(crate) fn propagates(&self) -> bool {
        matches!(self, Self::Cascade | Self::SetNull)
    }
}

// =============================================================================
// Identifier Quoting
// =============================================================================

/// Quotes an identifier for SQL text, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_value_equality_is_total() {
        assert_eq!(Value::Real(f64::NAN), Value::Real(f64::NAN));
        assert_ne!(Value::Real(0.0), Value::Real(-0.0));
        assert_ne!(Value::Integer(1), Value::Real(1.0));
        assert_eq!(Value::Text("a".into()), Value::Text("a".into()));
    }

    #[test]
    fn test_value_hashes_consistently() {
        let mut set = HashSet::new();
        set.insert(Value::Integer(7));
        set.insert(Value::Integer(7));
        set.insert(Value::Text("7".into()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = Row::from_pairs([("Name", Value::Text("Ann".into())), ("salary", Value::Integer(10))]);
        assert_eq!(row.value("name"), Some(&Value::Text("Ann".into())));
        assert_eq!(row.value("SALARY"), Some(&Value::Integer(10)));
        assert!(!row.contains("id"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("employee"), "\"employee\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
