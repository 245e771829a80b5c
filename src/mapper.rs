//! # Mapper
//!
//! Conversion between Rust values and engine rows.
//!
//! - [`ToValue`] / [`FromValue`]: one field to or from one [`Value`]
//! - [`FromRow`]: one result row to a typed record (entity or projection)
//! - [`Entity`]: a record that also owns a table
//!
//! Entities and projections implement these traits by hand; there is no
//! derive. An entity's [`Entity::to_values`] must produce values in the
//! flattened column order of its [`TableDef`]: declared columns and embedded
//! sub-structures in declaration order, embedded columns depth-first.
//!
//! ## Example
//!
//! ```rust
//! use spiteorm::mapper::{Entity, FromRow, RowShape, ToValue};
//! use spiteorm::schema::{ColumnDef, TableDef};
//! use spiteorm::{Result, Row, Value};
//!
//! struct Employee {
//!     id: i64,
//!     name: Option<String>,
//!     salary: i64,
//! }
//!
//! impl FromRow for Employee {
//!     fn shape() -> RowShape {
//!         Self::table().row_shape()
//!     }
//!
//!     fn from_row(row: &Row) -> Result<Self> {
//!         Ok(Employee {
//!             id: row.get("id")?,
//!             name: row.get("name")?,
//!             salary: row.get("salary")?,
//!         })
//!     }
//! }
//!
//! impl Entity for Employee {
//!     fn table() -> TableDef {
//!         TableDef::new("employee")
//!             .column(ColumnDef::integer("id"))
//!             .column(ColumnDef::text("name").nullable())
//!             .column(ColumnDef::integer("salary"))
//!             .auto_increment("id")
//!     }
//!
//!     fn to_values(&self) -> Result<Vec<Value>> {
//!         Ok(vec![self.id.to_value()?, self.name.to_value()?, self.salary.to_value()?])
//!     }
//! }
//! ```

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::schema::{ColumnDescriptor, EntityDescriptor, Member, TableDef};
use crate::types::{Row, Value};

// =============================================================================
// Field Conversion
// =============================================================================

/// Converts a Rust value into an engine value.
///
/// Widening conversions are implicit. Values that do not fit the engine's
/// 64-bit integer fail with [`Error::ArgumentRange`] rather than wrapping.
pub trait ToValue {
    fn to_value(&self) -> Result<Value>;
}

/// Converts an engine value into a Rust value.
///
/// `column` names the source column for error messages.
pub trait FromValue: Sized {
    fn from_value(value: &Value, column: &str) -> Result<Self>;
}

fn out_of_range(value: impl ToString, target: &'static str) -> Error {
    Error::ArgumentRange {
        name: String::new(),
        value: value.to_string(),
        target,
    }
}

fn mismatch(column: &str, expected: &'static str, found: &Value) -> Error {
    Error::TypeMismatch {
        column: column.to_string(),
        expected,
        found: found.type_name(),
    }
}

/// Fills in the name of an [`Error::ArgumentRange`] raised by [`ToValue`].
pub(crate) fn name_range_error(err: Error, name: &str) -> Error {
    match err {
        Error::ArgumentRange {
            name: n,
            value,
            target,
        } if n.is_empty() => Error::ArgumentRange {
            name: name.to_string(),
            value,
            target,
        },
        other => other,
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Result<Value> {
        Ok(self.clone())
    }
}

impl ToValue for i64 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Integer(*self))
    }
}

macro_rules! widening_to_value {
    ($($t:ty),*) => {
        $(
            impl ToValue for $t {
                fn to_value(&self) -> Result<Value> {
                    Ok(Value::Integer(i64::from(*self)))
                }
            }
        )*
    };
}

widening_to_value!(i8, i16, i32, u8, u16, u32);

macro_rules! checked_to_value {
    ($($t:ty),*) => {
        $(
            impl ToValue for $t {
                fn to_value(&self) -> Result<Value> {
                    i64::try_from(*self)
                        .map(Value::Integer)
                        .map_err(|_| out_of_range(*self, "INTEGER"))
                }
            }
        )*
    };
}

checked_to_value!(u64, usize, i128, u128);

impl ToValue for bool {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Integer(i64::from(*self)))
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Real(*self))
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Real(f64::from(*self)))
    }
}

impl ToValue for String {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.clone()))
    }
}

impl ToValue for str {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.to_string()))
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Blob(self.clone()))
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> Result<Value> {
        (**self).to_value()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Result<Value> {
        match self {
            Some(v) => v.to_value(),
            None => Ok(Value::Null),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value, _column: &str) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(*i),
            other => Err(mismatch(column, "INTEGER", other)),
        }
    }
}

macro_rules! narrowing_from_value {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &Value, column: &str) -> Result<Self> {
                    let wide = i64::from_value(value, column)?;
                    <$t>::try_from(wide).map_err(|_| Error::ArgumentRange {
                        name: column.to_string(),
                        value: wide.to_string(),
                        target: stringify!($t),
                    })
                }
            }
        )*
    };
}

narrowing_from_value!(i8, i16, i32, u8, u16, u32, u64, usize);

impl FromValue for bool {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        i64::from_value(value, column).map(|i| i != 0)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Real(r) => Ok(*r),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(mismatch(column, "REAL", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Text(t) => Ok(t.clone()),
            other => Err(mismatch(column, "TEXT", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Blob(b) => Ok(b.clone()),
            Value::Text(t) => Ok(t.as_bytes().to_vec()),
            other => Err(mismatch(column, "BLOB", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value, column: &str) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other, column).map(Some),
        }
    }
}

impl Row {
    /// Reads a column as `T`.
    ///
    /// A column absent from the row reads as `NULL`, so it decodes into
    /// `Option<T>` as `None` and fails with [`Error::ColumnMissing`] otherwise.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        match self.value(column) {
            Some(value) => T::from_value(value, column),
            None => T::from_value(&Value::Null, column).map_err(|_| Error::ColumnMissing {
                query: "result row".to_string(),
                column: column.to_string(),
            }),
        }
    }
}

// =============================================================================
// Row Shapes
// =============================================================================

/// A column a record reads, and whether it may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeColumn {
    pub name: String,
    pub nullable: bool,
}

/// The columns a [`FromRow`] type reads from a result set.
///
/// Used when the database opens to check that each registered query returns
/// every non-nullable column its result type needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowShape {
    columns: Vec<ShapeColumn>,
}

impl RowShape {
    pub fn new() -> Self {
        Self::default()
    }

    /// A column that must be present in the result set.
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ShapeColumn {
            name: name.into(),
            nullable: false,
        });
        self
    }

    /// A column that decodes to `None` when absent.
    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ShapeColumn {
            name: name.into(),
            nullable: true,
        });
        self
    }

    pub fn columns(&self) -> &[ShapeColumn] {
        &self.columns
    }
}

/// A typed record decoded from one result row.
pub trait FromRow: Sized + 'static {
    /// The columns `from_row` reads.
    fn shape() -> RowShape;

    fn from_row(row: &Row) -> Result<Self>;
}

/// A record persisted in its own table.
pub trait Entity: FromRow {
    /// Static declaration of the table.
    fn table() -> TableDef;

    /// Column values in flattened declaration order.
    fn to_values(&self) -> Result<Vec<Value>>;
}

impl FromRow for Row {
    fn shape() -> RowShape {
        RowShape::new()
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

// =============================================================================
// Entity Mapping
// =============================================================================

/// Produces the parameter list for an entity write, in column order.
///
/// An auto-generated key carrying `0` or `NULL` is bound as `NULL` so the
/// engine assigns one.
pub(crate) fn entity_to_params<E: Entity>(desc: &EntityDescriptor, entity: &E) -> Result<Vec<Value>> {
    let mut values = entity
        .to_values()
        .map_err(|e| name_range_error(e, desc.table()))?;

    if values.len() != desc.columns().len() {
        return Err(Error::argument_mismatch(
            desc.table(),
            format!(
                "entity produced {} values for {} columns",
                values.len(),
                desc.columns().len()
            ),
        ));
    }

    if desc.auto_generate() {
        for i in desc.key_positions() {
            if values[i] == Value::Integer(0) {
                values[i] = Value::Null;
            }
        }
    }
    Ok(values)
}

/// Decodes a row into an entity after checking it carries every required
/// column of the table.
pub fn row_to_entity<E: Entity>(desc: &EntityDescriptor, row: &Row) -> Result<E> {
    for column in desc.columns() {
        if !column.nullable && !row.contains(&column.column) {
            return Err(Error::ColumnMissing {
                query: desc.table().to_string(),
                column: column.column.clone(),
            });
        }
    }
    E::from_row(row)
}

/// Checks that `result_columns` covers every non-nullable column of `shape`.
pub(crate) fn check_coverage(query: &str, shape: &RowShape, result_columns: &[String]) -> Result<()> {
    for column in shape.columns() {
        if column.nullable {
            continue;
        }
        if !result_columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
            return Err(Error::ColumnMissing {
                query: query.to_string(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Flattening
// =============================================================================

/// Flattens a table declaration into its stored columns.
///
/// Embedded members contribute their columns with their prefix prepended;
/// nesting deeper than `max_depth` is rejected, as are two members that
/// flatten to the same column name.
pub(crate) fn flatten(table: &str, members: &[Member], max_depth: usize) -> Result<Vec<ColumnDescriptor>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    flatten_into(table, members, "", "", 0, max_depth, &mut out, &mut seen)?;
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn flatten_into(
    table: &str,
    members: &[Member],
    field_path: &str,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    out: &mut Vec<ColumnDescriptor>,
    seen: &mut HashSet<String>,
) -> Result<()> {
    for member in members {
        match member {
            Member::Column(def) => {
                let column = format!("{prefix}{}", def.column);
                if !seen.insert(column.to_ascii_lowercase()) {
                    return Err(Error::ColumnCollision {
                        table: table.to_string(),
                        column,
                    });
                }
                let field = if field_path.is_empty() {
                    def.field.clone()
                } else {
                    format!("{field_path}.{}", def.field)
                };
                out.push(ColumnDescriptor {
                    field,
                    column,
                    sql_type: def.sql_type,
                    nullable: def.nullable,
                });
            }
            Member::Embedded(embedded) => {
                if depth + 1 > max_depth {
                    return Err(Error::invalid_schema(
                        table,
                        format!(
                            "embedded '{}' nests deeper than the limit of {max_depth}",
                            embedded.field
                        ),
                    ));
                }
                let path = if field_path.is_empty() {
                    embedded.field.clone()
                } else {
                    format!("{field_path}.{}", embedded.field)
                };
                let nested_prefix = format!("{prefix}{}", embedded.prefix);
                flatten_into(
                    table,
                    &embedded.members,
                    &path,
                    &nested_prefix,
                    depth + 1,
                    max_depth,
                    out,
                    seen,
                )?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, EmbeddedDef};

    fn members(def: TableDef) -> Vec<Member> {
        def.members
    }

    #[test]
    fn test_to_value_rejects_out_of_range() {
        assert_eq!(42u32.to_value().unwrap(), Value::Integer(42));
        assert_eq!((i64::MAX as u64).to_value().unwrap(), Value::Integer(i64::MAX));
        let err = u64::MAX.to_value().unwrap_err();
        let err = name_range_error(err, "id");
        assert!(matches!(err, Error::ArgumentRange { ref name, .. } if name == "id"));
    }

    #[test]
    fn test_from_value_narrowing() {
        assert_eq!(i32::from_value(&Value::Integer(7), "n").unwrap(), 7);
        let err = i32::from_value(&Value::Integer(i64::from(i32::MAX) + 1), "n").unwrap_err();
        assert!(matches!(err, Error::ArgumentRange { target: "i32", .. }));
        let err = u32::from_value(&Value::Integer(-1), "n").unwrap_err();
        assert!(matches!(err, Error::ArgumentRange { .. }));
    }

    #[test]
    fn test_from_value_type_mismatch() {
        let err = i64::from_value(&Value::Text("x".into()), "salary").unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch { expected: "INTEGER", found: "TEXT", .. }
        ));
        assert_eq!(Option::<i64>::from_value(&Value::Null, "salary").unwrap(), None);
        assert_eq!(f64::from_value(&Value::Integer(2), "x").unwrap(), 2.0);
    }

    #[test]
    fn test_row_get_absent_column() {
        let row = Row::from_pairs([("id", Value::Integer(1))]);
        assert_eq!(row.get::<Option<String>>("name").unwrap(), None);
        assert!(matches!(row.get::<String>("name"), Err(Error::ColumnMissing { .. })));
    }

    #[test]
    fn test_flatten_with_prefix() {
        let def = TableDef::new("person")
            .column(ColumnDef::integer("id"))
            .embedded(
                EmbeddedDef::new("name")
                    .column(ColumnDef::text("first").column_name("first_name"))
                    .column(ColumnDef::text("last").column_name("last_name")),
            )
            .embedded(EmbeddedDef::new("alias").prefix("alias_").column(ColumnDef::text("first_name")));

        let columns = flatten("person", &members(def), 1).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(names, ["id", "first_name", "last_name", "alias_first_name"]);
        assert_eq!(columns[1].field, "name.first");
    }

    #[test]
    fn test_flatten_collision_without_prefix() {
        let def = TableDef::new("person")
            .column(ColumnDef::text("first_name"))
            .embedded(EmbeddedDef::new("name").column(ColumnDef::text("first_name")));

        let err = flatten("person", &members(def), 1).unwrap_err();
        assert!(matches!(err, Error::ColumnCollision { ref column, .. } if column == "first_name"));
    }

    #[test]
    fn test_flatten_depth_limit() {
        let def = TableDef::new("t").column(ColumnDef::integer("id")).embedded(
            EmbeddedDef::new("outer")
                .prefix("o_")
                .embedded(EmbeddedDef::new("inner").prefix("i_").column(ColumnDef::integer("v"))),
        );

        assert!(flatten("t", &members(def.clone()), 1).is_err());
        let columns = flatten("t", &members(def), 2).unwrap();
        assert_eq!(columns[1].column, "o_i_v");
        assert_eq!(columns[1].field, "outer.inner.v");
    }

    #[test]
    fn test_check_coverage() {
        let shape = RowShape::new().required("name").required("salary").optional("id");
        let columns = vec!["NAME".to_string(), "salary".to_string()];
        check_coverage("q", &shape, &columns).unwrap();

        let err = check_coverage("q", &shape, &columns[..1]).unwrap_err();
        assert!(matches!(err, Error::ColumnMissing { ref column, .. } if column == "salary"));
    }
}
