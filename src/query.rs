//! # Statement Compiler
//!
//! Registered queries are SQL text with named placeholders (`:name`). This
//! module parses that text once at registration, infers which tables a query
//! reads or writes, and at call time turns a query plus [`Args`] into a
//! [`PreparedStatement`]: positional SQL and an ordered parameter list.
//!
//! ## Placeholders
//!
//! ```text
//! SELECT * FROM employee WHERE salary > :min AND id IN (:ids)
//!                                       ^^^^               ^^^^
//!            bind("min", 100)  ──►  ?          bind_list("ids", [1, 2, 3])  ──►  ?, ?, ?
//! ```
//!
//! - A list argument expands to one positional parameter per element and is
//!   only accepted directly inside `IN ( )`. An empty list expands to
//!   `IN ()`, which matches no rows.
//! - Every placeholder must be bound, and every bound argument must match a
//!   placeholder. Either mismatch fails with [`Error::ArgumentMismatch`]
//!   before anything reaches the engine.
//! - Placeholder-like text inside string literals, quoted identifiers and
//!   comments is left alone.
//!
//! ## Result Shapes
//!
//! Each query declares what it returns ([`ResultShape`]). The shape is checked
//! against the engine's result columns when the database opens, and against
//! the Rust type requested at each call.

use std::any::{type_name, TypeId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rusqlite::{params_from_iter, Connection};

use crate::error::{Error, Result};
use crate::mapper::{name_range_error, FromRow, RowShape, ToValue};
use crate::schema::SchemaRegistry;
use crate::types::{Row, Value};

// =============================================================================
// Result Shapes
// =============================================================================

/// How many rows a row-returning query yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one row; none is reported as absent.
    One,
    /// Any number of rows, in query order.
    Many,
}

/// What a query returns.
#[derive(Debug, Clone)]
pub enum ResultShape {
    /// A write statement; returns the number of affected rows.
    Affected,
    /// A single scalar (first column of the first row).
    Value,
    /// Typed records.
    Rows {
        cardinality: Cardinality,
        type_id: TypeId,
        type_name: &'static str,
        shape: RowShape,
    },
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Affected => f.write_str("affected-row count"),
            Self::Value => f.write_str("scalar value"),
            Self::Rows {
                cardinality: Cardinality::One,
                type_name,
                ..
            } => write!(f, "one {type_name}"),
            Self::Rows {
                cardinality: Cardinality::Many,
                type_name,
                ..
            } => write!(f, "many {type_name}"),
        }
    }
}

// =============================================================================
// Query Descriptor
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Param(String),
}

/// A named, parameterized statement and its declared result shape.
///
/// # Example
///
/// ```rust,ignore
/// schema.register_query(QueryDescriptor::many::<Employee>(
///     "employee.salary_between",
///     "SELECT * FROM employee WHERE salary BETWEEN :min AND :max",
/// ))?;
/// schema.register_query(QueryDescriptor::affected(
///     "employee.raise",
///     "UPDATE employee SET salary = :salary WHERE id IN (:ids)",
/// ))?;
/// ```
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    name: String,
    sql: String,
    segments: Vec<Segment>,
    shape: ResultShape,
    declared: Vec<String>,
    dependencies: BTreeSet<String>,
    writes: BTreeSet<String>,
}

impl QueryDescriptor {
    fn with_shape(name: impl Into<String>, sql: impl Into<String>, shape: ResultShape) -> Self {
        let sql = sql.into();
        Self {
            name: name.into(),
            segments: parse(&sql),
            sql,
            shape,
            declared: Vec::new(),
            dependencies: BTreeSet::new(),
            writes: BTreeSet::new(),
        }
    }

    /// A query returning every matching row as `T`.
    pub fn many<T: FromRow>(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_shape(name, sql, rows_shape::<T>(Cardinality::Many))
    }

    /// A query returning at most one row as `T`.
    pub fn one<T: FromRow>(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_shape(name, sql, rows_shape::<T>(Cardinality::One))
    }

    /// A query returning a single scalar.
    pub fn value(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_shape(name, sql, ResultShape::Value)
    }

    /// A write statement returning its affected-row count.
    pub fn affected(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_shape(name, sql, ResultShape::Affected)
    }

    /// Adds tables to the dependency set beyond those named in the text
    /// (e.g. tables reached only through a view).
    pub fn depends_on<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn shape(&self) -> &ResultShape {
        &self.shape
    }

    /// Placeholder names in order of appearance (repeats included).
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(p) => Some(p.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Registered tables this query reads or writes.
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Registered tables a write query modifies directly (before cascades).
    pub fn writes(&self) -> &BTreeSet<String> {
        &self.writes
    }

    pub fn is_write(&self) -> bool {
        matches!(self.shape, ResultShape::Affected)
    }

    /// Resolves the dependency set against the registry.
    pub(crate) fn resolve_dependencies(mut self, registry: &SchemaRegistry) -> Result<Self> {
        let tokens = tokenize(&self.sql);

        for table in referenced_tables(&tokens) {
            if let Some(name) = registry.canonical_table(&table) {
                self.dependencies.insert(name.to_string());
            }
        }
        for table in &self.declared {
            let name = registry.canonical_table(table).ok_or_else(|| {
                Error::invalid_schema(
                    &self.name,
                    format!("depends on unregistered table '{table}'"),
                )
            })?;
            self.dependencies.insert(name.to_string());
        }

        if self.is_write() {
            self.writes = write_targets(&tokens)
                .iter()
                .filter_map(|t| registry.canonical_table(t))
                .map(str::to_string)
                .collect();
            if self.writes.is_empty() {
                self.writes = self.dependencies.clone();
            }
        }
        Ok(self)
    }

    /// SQL with every placeholder replaced by a single `?`, for preparing
    /// the statement without arguments.
    pub(crate) fn probe_sql(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Text(t) => t.as_str(),
                Segment::Param(_) => "?",
            })
            .collect()
    }

    // =========================================================================
    // Call-site Shape Checks
    // =========================================================================

    fn shape_mismatch(&self, requested: impl Into<String>) -> Error {
        Error::ShapeMismatch {
            query: self.name.clone(),
            declared: self.shape.to_string(),
            requested: requested.into(),
        }
    }

    pub(crate) fn expect_rows<T: FromRow>(&self, cardinality: Cardinality) -> Result<()> {
        match &self.shape {
            ResultShape::Rows {
                cardinality: declared,
                type_id,
                ..
            } if *declared == cardinality && *type_id == TypeId::of::<T>() => Ok(()),
            _ => Err(self.shape_mismatch(rows_shape::<T>(cardinality).to_string())),
        }
    }

    pub(crate) fn expect_value(&self) -> Result<()> {
        match self.shape {
            ResultShape::Value => Ok(()),
            _ => Err(self.shape_mismatch(ResultShape::Value.to_string())),
        }
    }

    pub(crate) fn expect_affected(&self) -> Result<()> {
        match self.shape {
            ResultShape::Affected => Ok(()),
            _ => Err(self.shape_mismatch(ResultShape::Affected.to_string())),
        }
    }
}

fn rows_shape<T: FromRow>(cardinality: Cardinality) -> ResultShape {
    ResultShape::Rows {
        cardinality,
        type_id: TypeId::of::<T>(),
        type_name: short_type_name::<T>(),
        shape: T::shape(),
    }
}

fn short_type_name<T>() -> &'static str {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Clone)]
enum Arg {
    Single(Value),
    List(Vec<Value>),
}

#[derive(Debug, Clone)]
enum ArgFailure {
    Range {
        name: String,
        value: String,
        target: &'static str,
    },
    Other(String),
}

/// Named arguments for one query call.
///
/// ```rust
/// use spiteorm::Args;
///
/// let args = Args::new().bind("min", 100).bind_list("ids", [1, 2, 3]);
/// assert_eq!(args.len(), 2);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Args {
    bound: Vec<(String, Arg)>,
    failure: Option<ArgFailure>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a single value to `:name`.
    pub fn bind(mut self, name: impl Into<String>, value: impl ToValue) -> Self {
        let name = name.into();
        match value.to_value() {
            Ok(v) => self.bound.push((name, Arg::Single(v))),
            Err(e) => self.record(name, e),
        }
        self
    }

    /// Binds a list to `:name`, for use inside `IN (:name)`.
    pub fn bind_list<I, T>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToValue,
    {
        let name = name.into();
        let mut list = Vec::new();
        for value in values {
            match value.to_value() {
                Ok(v) => list.push(v),
                Err(e) => {
                    self.record(name, e);
                    return self;
                }
            }
        }
        self.bound.push((name, Arg::List(list)));
        self
    }

    /// Keeps the first conversion failure; it is reported at compile time.
    fn record(&mut self, name: String, err: Error) {
        if self.failure.is_some() {
            return;
        }
        self.failure = Some(match name_range_error(err, &name) {
            Error::ArgumentRange { name, value, target } => ArgFailure::Range { name, value, target },
            other => ArgFailure::Other(format!("'{name}': {other}")),
        });
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

// =============================================================================
// Compilation
// =============================================================================

/// A statement ready for the engine: positional SQL plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Binds `args` to `query`'s placeholders.
pub fn compile(query: &QueryDescriptor, args: &Args) -> Result<PreparedStatement> {
    match &args.failure {
        Some(ArgFailure::Range { name, value, target }) => {
            return Err(Error::ArgumentRange {
                name: name.clone(),
                value: value.clone(),
                target: *target,
            });
        }
        Some(ArgFailure::Other(reason)) => {
            return Err(Error::argument_mismatch(query.name(), reason.clone()));
        }
        None => {}
    }

    let mut seen = BTreeSet::new();
    for (name, _) in &args.bound {
        if !seen.insert(name.as_str()) {
            return Err(Error::argument_mismatch(
                query.name(),
                format!("argument '{name}' bound twice"),
            ));
        }
    }

    let mut sql = String::with_capacity(query.sql.len());
    let mut params = Vec::new();
    let mut used = BTreeSet::new();

    for (i, segment) in query.segments.iter().enumerate() {
        match segment {
            Segment::Text(text) => sql.push_str(text),
            Segment::Param(name) => {
                let arg = args
                    .bound
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, a)| a)
                    .ok_or_else(|| {
                        Error::argument_mismatch(query.name(), format!("no argument bound for ':{name}'"))
                    })?;
                used.insert(name.as_str());

                match arg {
                    Arg::Single(value) => {
                        sql.push('?');
                        params.push(value.clone());
                    }
                    Arg::List(values) => {
                        if !inside_in_list(&query.segments, i) {
                            return Err(Error::argument_mismatch(
                                query.name(),
                                format!("list argument ':{name}' is only allowed inside IN (...)"),
                            ));
                        }
                        let slots = vec!["?"; values.len()];
                        sql.push_str(&slots.join(", "));
                        params.extend(values.iter().cloned());
                    }
                }
            }
        }
    }

    for (name, _) in &args.bound {
        if !used.contains(name.as_str()) {
            return Err(Error::argument_mismatch(
                query.name(),
                format!("argument '{name}' matches no placeholder"),
            ));
        }
    }

    Ok(PreparedStatement { sql, params })
}

fn inside_in_list(segments: &[Segment], index: usize) -> bool {
    let before = match index.checked_sub(1).map(|i| &segments[i]) {
        Some(Segment::Text(t)) => t.trim_end(),
        _ => return false,
    };
    let after = match segments.get(index + 1) {
        Some(Segment::Text(t)) => t.trim_start(),
        _ => return false,
    };
    let Some(head) = before.strip_suffix('(') else {
        return false;
    };
    let head = head.trim_end().as_bytes();
    let Some(keyword_start) = head.len().checked_sub(2) else {
        return false;
    };
    if !head[keyword_start..].eq_ignore_ascii_case(b"IN") {
        return false;
    }
    let boundary = keyword_start
        .checked_sub(1)
        .and_then(|i| head.get(i))
        .map_or(true, |&c| !is_ident_char(c));
    boundary && after.starts_with(')')
}

// =============================================================================
// Execution
// =============================================================================

impl PreparedStatement {
    /// Runs the statement and collects every row.
    pub(crate) fn query_rows(&self, conn: &Connection) -> Result<Vec<Row>> {
        read_rows(conn, &self.sql, &self.params)
    }

    /// Runs the statement and returns the first column of the first row.
    pub(crate) fn query_value(&self, conn: &Connection) -> Result<Option<Value>> {
        let mut stmt = conn.prepare_cached(&self.sql)?;
        let mut rows = stmt.query(params_from_iter(self.params.iter()))?;
        match rows.next()? {
            Some(row) => Ok(Some(Value::from_value_ref(row.get_ref(0)?))),
            None => Ok(None),
        }
    }

    /// Runs a write and returns the affected-row count.
    pub(crate) fn execute(&self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn.prepare_cached(&self.sql)?;
        Ok(stmt.execute(params_from_iter(self.params.iter()))?)
    }
}

/// Runs `sql` with positional `params` and collects the rows.
pub(crate) fn read_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>()
        .into();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(Value::from_value_ref(row.get_ref(i)?));
        }
        out.push(Row::new(Arc::clone(&columns), values));
    }
    Ok(out)
}

// =============================================================================
// Parsing
// =============================================================================

/// Splits SQL into literal text and `:name` placeholders.
fn parse(sql: &str) -> Vec<Segment> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'[' => i = skip_until(bytes, i + 1, b"]"),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_until(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_until(bytes, i + 2, b"*/"),
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).is_some_and(|b| is_ident_start(*b)) => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_ident_char(bytes[end]) {
                    end += 1;
                }
                if text_start < i {
                    segments.push(Segment::Text(sql[text_start..i].to_string()));
                }
                segments.push(Segment::Param(sql[start..end].to_string()));
                text_start = end;
                i = end;
            }
            _ => i += 1,
        }
    }
    if text_start < sql.len() {
        segments.push(Segment::Text(sql[text_start..].to_string()));
    }
    segments
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Returns the index just past a quoted run starting at `start`. A doubled
/// quote inside the run is an escaped quote.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_until(bytes: &[u8], start: usize, end: &[u8]) -> usize {
    let mut i = start;
    while i < bytes.len() {
        if bytes[i..].starts_with(end) {
            return i + end.len();
        }
        i += 1;
    }
    bytes.len()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare word, uppercased for keyword comparison; `raw` keeps the case.
    Word { upper: String, raw: String },
    /// Quoted identifier, unquoted.
    Quoted(String),
    Punct(u8),
}

impl Token {
    fn identifier(&self) -> Option<&str> {
        match self {
            Self::Word { raw, .. } => Some(raw),
            Self::Quoted(name) => Some(name),
            Self::Punct(_) => None,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word { upper, .. } if upper == keyword)
    }
}

fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' => i = skip_quoted(bytes, i),
            b'"' | b'`' => {
                let end = skip_quoted(bytes, i);
                let inner = sql.get(i + 1..end.saturating_sub(1)).unwrap_or("");
                let quote = (b as char).to_string();
                tokens.push(Token::Quoted(inner.replace(&quote.repeat(2), &quote)));
                i = end;
            }
            b'[' => {
                let end = skip_until(bytes, i + 1, b"]");
                let inner = sql.get(i + 1..end.saturating_sub(1)).unwrap_or("");
                tokens.push(Token::Quoted(inner.to_string()));
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_until(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_until(bytes, i + 2, b"*/"),
            b':' => {
                i += 1;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
            }
            _ if is_ident_char(b) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                let raw = &sql[start..i];
                tokens.push(Token::Word {
                    upper: raw.to_ascii_uppercase(),
                    raw: raw.to_string(),
                });
            }
            _ if b.is_ascii_whitespace() => i += 1,
            _ => {
                tokens.push(Token::Punct(b));
                i += 1;
            }
        }
    }
    tokens
}

/// Keywords that end a `FROM a, b` table list.
const LIST_TERMINATORS: [&str; 12] = [
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "JOIN", "ON", "UNION", "EXCEPT", "INTERSECT",
    "SET", "VALUES",
];

/// Table names following `FROM`, `JOIN`, `INTO` and `UPDATE`, including every
/// entry of a comma-separated `FROM` list.
fn referenced_tables(tokens: &[Token]) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_from_list = false;
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        let introduces = ["FROM", "JOIN", "INTO", "UPDATE"]
            .iter()
            .any(|k| token.is_keyword(k));

        if introduces {
            in_from_list = token.is_keyword("FROM");
            if let Some(name) = table_name_at(tokens, i + 1) {
                out.push(name);
            }
        } else if in_from_list {
            match token {
                Token::Punct(b',') => {
                    if let Some(name) = table_name_at(tokens, i + 1) {
                        out.push(name);
                    }
                }
                Token::Punct(b'(') | Token::Punct(b')') => in_from_list = false,
                t if LIST_TERMINATORS.iter().any(|k| t.is_keyword(k)) => in_from_list = false,
                _ => {}
            }
        }
        i += 1;
    }
    out
}

/// Reads a possibly schema-qualified table name starting at `index`.
fn table_name_at(tokens: &[Token], index: usize) -> Option<String> {
    let name = tokens.get(index)?.identifier()?;
    if tokens.get(index + 1) == Some(&Token::Punct(b'.')) {
        return tokens
            .get(index + 2)
            .and_then(Token::identifier)
            .map(str::to_string);
    }
    Some(name.to_string())
}

/// Tables a write statement modifies directly.
fn write_targets(tokens: &[Token]) -> Vec<String> {
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let target = if token.is_keyword("UPDATE") || token.is_keyword("INTO") {
            i + 1
        } else if token.is_keyword("DELETE") && tokens.get(i + 1).is_some_and(|t| t.is_keyword("FROM")) {
            i + 2
        } else {
            continue;
        };
        if let Some(name) = table_name_at(tokens, target) {
            out.push(name);
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str) -> QueryDescriptor {
        QueryDescriptor::affected("q", sql)
    }

    #[test]
    fn test_parse_placeholders() {
        let q = QueryDescriptor::value(
            "q",
            "SELECT ':skip', \"a:b\" FROM t WHERE x = :first -- :comment\n AND y::text = :second_2",
        );
        let params: Vec<&str> = q.parameters().collect();
        assert_eq!(params, ["first", "second_2"]);
    }

    #[test]
    fn test_compile_single_and_list() {
        let q = query("UPDATE employee SET salary = :salary WHERE id IN (:ids)");
        let args = Args::new().bind("salary", 500).bind_list("ids", [1, 2, 3]);
        let stmt = compile(&q, &args).unwrap();

        assert_eq!(stmt.sql, "UPDATE employee SET salary = ? WHERE id IN (?, ?, ?)");
        assert_eq!(
            stmt.params,
            vec![Value::Integer(500), Value::Integer(1), Value::Integer(2), Value::Integer(3)]
        );
    }

    #[test]
    fn test_compile_empty_list() {
        let q = query("DELETE FROM employee WHERE id IN ( :ids )");
        let stmt = compile(&q, &Args::new().bind_list("ids", Vec::<i64>::new())).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM employee WHERE id IN (  )");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_compile_repeated_placeholder() {
        let q = QueryDescriptor::value("q", "SELECT :v + :v");
        let stmt = compile(&q, &Args::new().bind("v", 2)).unwrap();
        assert_eq!(stmt.sql, "SELECT ? + ?");
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_compile_argument_mismatches() {
        let q = query("DELETE FROM employee WHERE id = :id");

        let missing = compile(&q, &Args::new()).unwrap_err();
        assert!(matches!(missing, Error::ArgumentMismatch { ref reason, .. } if reason.contains(":id")));

        let unused = compile(&q, &Args::new().bind("id", 1).bind("extra", 2)).unwrap_err();
        assert!(matches!(unused, Error::ArgumentMismatch { ref reason, .. } if reason.contains("extra")));

        let twice = compile(&q, &Args::new().bind("id", 1).bind("id", 2)).unwrap_err();
        assert!(matches!(twice, Error::ArgumentMismatch { .. }));

        let list = compile(&q, &Args::new().bind_list("id", [1])).unwrap_err();
        assert!(matches!(list, Error::ArgumentMismatch { ref reason, .. } if reason.contains("IN")));
    }

    #[test]
    fn test_list_requires_in_keyword() {
        let ids = || Args::new().bind("a", 1).bind_list("ids", [1, 2]);

        let bare = query("DELETE FROM t WHERE x = :a(:ids)");
        assert!(matches!(compile(&bare, &ids()).unwrap_err(), Error::ArgumentMismatch { .. }));

        let min = query("DELETE FROM t WHERE x = :a AND y = MIN(:ids)");
        assert!(matches!(compile(&min, &ids()).unwrap_err(), Error::ArgumentMismatch { .. }));

        let tight = query("DELETE FROM t WHERE x = :a AND y IN(:ids)");
        assert_eq!(compile(&tight, &ids()).unwrap().sql, "DELETE FROM t WHERE x = ? AND y IN(?, ?)");

        let leading = QueryDescriptor::value("q", "IN(:ids)");
        let stmt = compile(&leading, &Args::new().bind_list("ids", [7])).unwrap();
        assert_eq!(stmt.sql, "IN(?)");
    }

    #[test]
    fn test_compile_out_of_range() {
        let q = query("DELETE FROM employee WHERE id = :id");
        let err = compile(&q, &Args::new().bind("id", u64::MAX)).unwrap_err();
        assert!(matches!(err, Error::ArgumentRange { ref name, .. } if name == "id"));
    }

    #[test]
    fn test_referenced_tables() {
        let tokens = tokenize(
            "SELECT e.name, d.name AS department_name FROM employee e, \"department\" d \
             JOIN main.car c ON c.employee_id = e.id WHERE e.id IN (SELECT id FROM badge)",
        );
        let tables = referenced_tables(&tokens);
        assert_eq!(tables, ["employee", "department", "car", "badge"]);
    }

    #[test]
    fn test_write_targets() {
        let tokens = tokenize("DELETE FROM car WHERE employee_id IN (SELECT id FROM employee)");
        assert_eq!(write_targets(&tokens), ["car"]);
        let tokens = tokenize("INSERT OR REPLACE INTO badge (id) VALUES (:id)");
        assert_eq!(write_targets(&tokens), ["badge"]);
    }

    #[test]
    fn test_probe_sql() {
        let q = query("UPDATE employee SET salary = :s WHERE id IN (:ids)");
        assert_eq!(q.probe_sql(), "UPDATE employee SET salary = ? WHERE id IN (?)");
    }

    #[test]
    fn test_read_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER, b TEXT); INSERT INTO t VALUES (1, 'x'), (2, NULL);")
            .unwrap();
        let rows = read_rows(&conn, "SELECT a, b FROM t ORDER BY a", &[]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns(), ["a", "b"]);
        assert_eq!(rows[1].value("b"), Some(&Value::Null));
    }
}
