//! # Schema Registry
//!
//! This module turns static table declarations ([`TableDef`]) into immutable,
//! validated [`EntityDescriptor`]s, and owns everything derived from them:
//!
//! - the `CREATE TABLE` / `CREATE INDEX` statements issued once at open
//! - the compiled write statements for each entity (insert per conflict
//!   policy, update by key, delete by key, select by key)
//! - the registered queries and relations
//! - the cascade closure used by the Change Notifier
//!
//! ## Declaration Overview
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────────────┐
//! │ TableDef (per Entity)    │        │ EntityDescriptor (registered)     │
//! │                          │        │                                  │
//! │  columns + embedded      │ ─────► │  flattened columns, in order      │
//! │  primary key             │        │  primary key / auto-generate      │
//! │  foreign keys, indices   │        │  foreign keys, indices            │
//! └──────────────────────────┘        │  compiled statements              │
//!                                     └──────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! Everything is registered before the database opens. Opening freezes the
//! registry behind an `Arc`; from then on it is shared read-only by the writer
//! thread, the reader pool and the Change Notifier without locking.

use std::any::{type_name, TypeId};
use std::collections::{BTreeSet, HashMap, VecDeque};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mapper::{self, Entity, RowShape};
use crate::query::{QueryDescriptor, ResultShape};
use crate::relation::RelationSpec;
use crate::types::{quote_ident, ConflictPolicy, ForeignKeyAction, SqlType};

// =============================================================================
// Constants
// =============================================================================

/// Default nesting depth for embedded sub-structures.
pub const DEFAULT_MAX_EMBED_DEPTH: usize = 1;

/// Metadata table holding the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spiteorm_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Table name prefixes reserved for the engine and for SpiteORM itself.
const RESERVED_PREFIXES: [&str; 2] = ["sqlite_", "spiteorm_"];

// =============================================================================
// Declarations
// =============================================================================

/// One declared column.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub(crate) field: String,
    pub(crate) column: String,
    pub(crate) sql_type: SqlType,
    pub(crate) nullable: bool,
}

impl ColumnDef {
    /// Declares a non-nullable column named after its field.
    pub fn new(field: impl Into<String>, sql_type: SqlType) -> Self {
        let field = field.into();
        Self {
            column: field.clone(),
            field,
            sql_type,
            nullable: false,
        }
    }

    pub fn integer(field: impl Into<String>) -> Self {
        Self::new(field, SqlType::Integer)
    }

    pub fn real(field: impl Into<String>) -> Self {
        Self::new(field, SqlType::Real)
    }

    pub fn text(field: impl Into<String>) -> Self {
        Self::new(field, SqlType::Text)
    }

    pub fn blob(field: impl Into<String>) -> Self {
        Self::new(field, SqlType::Blob)
    }

    /// Stores the field under a different column name.
    pub fn column_name(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Allows `NULL`.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A sub-structure whose columns are stored inline in the parent's table.
///
/// Columns are flattened into the parent's column list with `prefix`
/// prepended. Nested embeddings are allowed up to the registry's depth limit.
#[derive(Debug, Clone)]
pub struct EmbeddedDef {
    pub(crate) field: String,
    pub(crate) prefix: String,
    pub(crate) members: Vec<Member>,
}

impl EmbeddedDef {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            prefix: String::new(),
            members: Vec::new(),
        }
    }

    /// Prepends `prefix` to every column name of this sub-structure.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.members.push(Member::Column(column));
        self
    }

    pub fn embedded(mut self, embedded: EmbeddedDef) -> Self {
        self.members.push(Member::Embedded(embedded));
        self
    }
}

/// A member of a table or embedded declaration, in declaration order.
#[derive(Debug, Clone)]
pub(crate) enum Member {
    Column(ColumnDef),
    Embedded(EmbeddedDef),
}

/// A foreign-key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDescriptor {
    /// Referencing column in this table.
    pub column: String,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced column (primary key or unique-indexed).
    pub parent_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
    /// Checked at commit instead of at the end of each statement.
    pub deferred: bool,
}

impl ForeignKeyDescriptor {
    pub fn new(
        column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
            deferred: false,
        }
    }

    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

/// An index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Explicit name; defaults to `index_<table>_<columns>`.
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn resolved_name(&self, table: &str) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("index_{}_{}", table, self.columns.join("_")))
    }
}

/// Static declaration of an entity's table, returned by [`Entity::table`].
///
/// # Example
///
/// ```rust
/// use spiteorm::schema::{ColumnDef, TableDef};
///
/// let def = TableDef::new("employee")
///     .column(ColumnDef::integer("id"))
///     .column(ColumnDef::text("name").nullable())
///     .column(ColumnDef::integer("salary"))
///     .auto_increment("id");
/// assert_eq!(def.table_name(), "employee");
/// ```
#[derive(Debug, Clone)]
pub struct TableDef {
    pub(crate) table: String,
    pub(crate) members: Vec<Member>,
    pub(crate) primary_key: Vec<String>,
    pub(crate) auto_generate: bool,
    pub(crate) foreign_keys: Vec<ForeignKeyDescriptor>,
    pub(crate) indices: Vec<IndexDescriptor>,
}

impl TableDef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            members: Vec::new(),
            primary_key: Vec::new(),
            auto_generate: false,
            foreign_keys: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.members.push(Member::Column(column));
        self
    }

    pub fn embedded(mut self, embedded: EmbeddedDef) -> Self {
        self.members.push(Member::Embedded(embedded));
        self
    }

    /// Declares a (possibly composite) primary key by column name.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self.auto_generate = false;
        self
    }

    /// Declares a single integer primary key assigned by the engine when the
    /// entity carries `0` or `NULL`.
    pub fn auto_increment(mut self, column: impl Into<String>) -> Self {
        self.primary_key = vec![column.into()];
        self.auto_generate = true;
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indices.push(index);
        self
    }

    /// The row shape an entity decoded from this table expects.
    ///
    /// Flattens without a depth limit; registration enforces the limit.
    pub fn row_shape(&self) -> RowShape {
        let mut shape = RowShape::new();
        if let Ok(columns) = mapper::flatten(&self.table, &self.members, usize::MAX) {
            for column in columns {
                shape = if column.nullable {
                    shape.optional(column.column)
                } else {
                    shape.required(column.column)
                };
            }
        }
        shape
    }
}

// =============================================================================
// Registered Descriptors
// =============================================================================

/// A flattened, registered column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Field path, e.g. `name.first_name` for embedded fields.
    pub field: String,
    pub column: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

/// The immutable, validated description of one table.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    table: String,
    type_name: &'static str,
    columns: Vec<ColumnDescriptor>,
    primary_key: Vec<String>,
    auto_generate: bool,
    foreign_keys: Vec<ForeignKeyDescriptor>,
    indices: Vec<IndexDescriptor>,
}

impl EntityDescriptor {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Rust type this table was registered for.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Flattened columns, in the order `Entity::to_values` must produce.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn auto_generate(&self) -> bool {
        self.auto_generate
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyDescriptor] {
        &self.foreign_keys
    }

    pub fn indices(&self) -> &[IndexDescriptor] {
        &self.indices
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.column.eq_ignore_ascii_case(column))
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    /// Positions of the primary-key columns in [`columns`](Self::columns).
    pub(crate) fn key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    fn is_unique_key(&self, column: &str) -> bool {
        let single_pk = self.primary_key.len() == 1 && self.primary_key[0].eq_ignore_ascii_case(column);
        let unique_index = self.indices.iter().any(|ix| {
            ix.unique && ix.columns.len() == 1 && ix.columns[0].eq_ignore_ascii_case(column)
        });
        single_pk || unique_index
    }
}

/// Write statements compiled once per entity at registration.
#[derive(Debug, Clone)]
pub(crate) struct TableStatements {
    /// Indexed by [`ConflictPolicy::index`].
    pub insert: [String; 3],
    pub update: String,
    /// Value positions bound to `update`, in placeholder order.
    pub update_params: Vec<usize>,
    pub delete: String,
    pub select_by_key: String,
}

impl TableStatements {
    pub fn insert(&self, policy: ConflictPolicy) -> &str {
        &self.insert[policy.index()]
    }
}

#[derive(Debug)]
struct RegisteredEntity {
    descriptor: EntityDescriptor,
    statements: TableStatements,
}

// =============================================================================
// Schema Registry
// =============================================================================

/// Registry of every entity, query and relation known to a database.
///
/// # Example
///
/// ```rust,ignore
/// let mut schema = SchemaRegistry::new(1);
/// schema.register::<Employee>()?;
/// schema.register::<Car>()?;
/// schema.register_query(QueryDescriptor::many::<Employee>("employee.all", "SELECT * FROM employee"))?;
/// let db = Database::open("app.db", schema)?;
/// ```
#[derive(Debug)]
pub struct SchemaRegistry {
    version: u32,
    max_embed_depth: usize,
    entities: Vec<RegisteredEntity>,
    by_table: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
    queries: HashMap<String, QueryDescriptor>,
    relations: HashMap<String, RelationSpec>,
}

impl SchemaRegistry {
    /// Creates an empty registry for the given schema version.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            max_embed_depth: DEFAULT_MAX_EMBED_DEPTH,
            entities: Vec::new(),
            by_table: HashMap::new(),
            by_type: HashMap::new(),
            queries: HashMap::new(),
            relations: HashMap::new(),
        }
    }

    /// Sets how deep embedded sub-structures may nest. Applies to entities
    /// registered afterward.
    pub fn with_max_embed_depth(mut self, depth: usize) -> Self {
        self.max_embed_depth = depth;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Registers the table of entity type `E`.
    ///
    /// Parents must be registered before the children that reference them.
    pub fn register<E: Entity>(&mut self) -> Result<()> {
        let type_id = TypeId::of::<E>();
        if self.by_type.contains_key(&type_id) {
            return Err(Error::DuplicateTable(E::table().table));
        }
        let index = self.register_def(E::table(), type_name::<E>())?;
        self.by_type.insert(type_id, index);
        Ok(())
    }

    fn register_def(&mut self, def: TableDef, type_name: &'static str) -> Result<usize> {
        let table = def.table.clone();
        let key = table.to_ascii_lowercase();

        if table.is_empty() {
            return Err(Error::invalid_schema(type_name, "empty table name"));
        }
        if RESERVED_PREFIXES.iter().any(|p| key.starts_with(p)) {
            return Err(Error::invalid_schema(&table, "table name uses a reserved prefix"));
        }
        if self.by_table.contains_key(&key) {
            return Err(Error::DuplicateTable(table));
        }

        let columns = mapper::flatten(&table, &def.members, self.max_embed_depth)?;
        if columns.is_empty() {
            return Err(Error::invalid_schema(&table, "no columns declared"));
        }

        let descriptor = EntityDescriptor {
            table: table.clone(),
            type_name,
            columns,
            primary_key: def.primary_key,
            auto_generate: def.auto_generate,
            foreign_keys: def.foreign_keys,
            indices: def.indices,
        };

        self.validate_keys(&descriptor)?;
        self.validate_foreign_keys(&descriptor)?;

        let statements = compile_statements(&descriptor);
        debug!(table = %table, columns = descriptor.columns.len(), "registered entity");

        self.entities.push(RegisteredEntity {
            descriptor,
            statements,
        });
        let index = self.entities.len() - 1;
        self.by_table.insert(key, index);
        Ok(index)
    }

    fn validate_keys(&self, desc: &EntityDescriptor) -> Result<()> {
        let table = desc.table();

        if desc.primary_key.is_empty() {
            return Err(Error::invalid_schema(table, "no primary key declared"));
        }
        for key in &desc.primary_key {
            if !desc.has_column(key) {
                return Err(Error::invalid_schema(
                    table,
                    format!("primary key column '{key}' is not declared"),
                ));
            }
        }
        if desc.auto_generate {
            let single_integer = desc.primary_key.len() == 1
                && desc
                    .column_index(&desc.primary_key[0])
                    .is_some_and(|i| desc.columns[i].sql_type == SqlType::Integer);
            if !single_integer {
                return Err(Error::invalid_schema(
                    table,
                    "auto-generated keys must be a single INTEGER column",
                ));
            }
        }
        for index in &desc.indices {
            if index.columns.is_empty() {
                return Err(Error::invalid_schema(table, "index without columns"));
            }
            for column in &index.columns {
                if !desc.has_column(column) {
                    return Err(Error::invalid_schema(
                        table,
                        format!("index column '{column}' is not declared"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_foreign_keys(&self, desc: &EntityDescriptor) -> Result<()> {
        let table = desc.table();

        for fk in &desc.foreign_keys {
            let Some(index) = desc.column_index(&fk.column) else {
                return Err(Error::invalid_schema(
                    table,
                    format!("foreign key column '{}' is not declared", fk.column),
                ));
            };

            let parent = if fk.parent_table.eq_ignore_ascii_case(table) {
                desc
            } else {
                self.resolve_table(&fk.parent_table).map_err(|_| {
                    Error::invalid_schema(
                        table,
                        format!("foreign key references unregistered table '{}'", fk.parent_table),
                    )
                })?
            };

            if !parent.has_column(&fk.parent_column) {
                return Err(Error::invalid_schema(
                    table,
                    format!(
                        "foreign key references missing column '{}.{}'",
                        fk.parent_table, fk.parent_column
                    ),
                ));
            }
            if !parent.is_unique_key(&fk.parent_column) {
                return Err(Error::invalid_schema(
                    table,
                    format!(
                        "'{}.{}' is neither the primary key nor uniquely indexed",
                        fk.parent_table, fk.parent_column
                    ),
                ));
            }

            let set_null = fk.on_delete == ForeignKeyAction::SetNull
                || fk.on_update == ForeignKeyAction::SetNull;
            if set_null && !desc.columns[index].nullable {
                return Err(Error::invalid_schema(
                    table,
                    format!("SET NULL on non-nullable column '{}'", fk.column),
                ));
            }
        }
        Ok(())
    }

    /// Looks up the descriptor registered for entity type `E`.
    pub fn resolve<E: Entity>(&self) -> Result<&EntityDescriptor> {
        self.by_type
            .get(&TypeId::of::<E>())
            .map(|&i| &self.entities[i].descriptor)
            .ok_or_else(|| Error::UnknownEntity(type_name::<E>().to_string()))
    }

    /// Looks up a descriptor by table name (case-insensitive).
    pub fn resolve_table(&self, table: &str) -> Result<&EntityDescriptor> {
        self.by_table
            .get(&table.to_ascii_lowercase())
            .map(|&i| &self.entities[i].descriptor)
            .ok_or_else(|| Error::UnknownEntity(table.to_string()))
    }

    pub(crate) fn statements<E: Entity>(&self) -> Result<(&EntityDescriptor, &TableStatements)> {
        self.by_type
            .get(&TypeId::of::<E>())
            .map(|&i| (&self.entities[i].descriptor, &self.entities[i].statements))
            .ok_or_else(|| Error::UnknownEntity(type_name::<E>().to_string()))
    }

    /// Registered tables, in registration order.
    pub fn tables(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.iter().map(|e| &e.descriptor)
    }

    /// Canonical name of a registered table, if any.
    pub(crate) fn canonical_table(&self, name: &str) -> Option<&str> {
        self.resolve_table(name).ok().map(|d| d.table())
    }

    // =========================================================================
    // Queries and Relations
    // =========================================================================

    /// Registers a query. Its dependency set is completed here from the
    /// tables its text mentions.
    pub fn register_query(&mut self, query: QueryDescriptor) -> Result<()> {
        if self.queries.contains_key(query.name()) {
            return Err(Error::invalid_schema(query.name(), "query name registered twice"));
        }
        let query = query.resolve_dependencies(self)?;
        debug!(query = query.name(), tables = ?query.dependencies(), "registered query");
        self.queries.insert(query.name().to_string(), query);
        Ok(())
    }

    pub fn query(&self, name: &str) -> Result<&QueryDescriptor> {
        self.queries
            .get(name)
            .ok_or_else(|| Error::UnknownQuery(name.to_string()))
    }

    pub fn queries(&self) -> impl Iterator<Item = &QueryDescriptor> {
        self.queries.values()
    }

    /// Registers a one-to-many relation.
    pub fn register_relation(&mut self, relation: RelationSpec) -> Result<()> {
        if self.relations.contains_key(relation.name()) {
            return Err(Error::invalid_schema(relation.name(), "relation name registered twice"));
        }
        relation.validate(self)?;
        self.relations.insert(relation.name().to_string(), relation);
        Ok(())
    }

    pub fn relation(&self, name: &str) -> Result<&RelationSpec> {
        self.relations
            .get(name)
            .ok_or_else(|| Error::UnknownRelation(name.to_string()))
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationSpec> {
        self.relations.values()
    }

    // =========================================================================
    // Cascade Closure
    // =========================================================================

    /// Tables a write to `table` can modify: the table itself plus every
    /// table reached through `CASCADE`/`SET NULL` foreign-key actions.
    pub fn affected_tables(&self, table: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue = VecDeque::new();
        if let Some(name) = self.canonical_table(table) {
            queue.push_back(name.to_string());
        } else {
            queue.push_back(table.to_string());
        }

        while let Some(current) = queue.pop_front() {
            if !out.insert(current.clone()) {
                continue;
            }
            for child in self.tables() {
                let propagates = child.foreign_keys().iter().any(|fk| {
                    fk.parent_table.eq_ignore_ascii_case(&current)
                        && (fk.on_delete.propagates() || fk.on_update.propagates())
                });
                if propagates {
                    queue.push_back(child.table().to_string());
                }
            }
        }
        out
    }

    // =========================================================================
    // DDL
    // =========================================================================

    /// Every `CREATE TABLE` and `CREATE INDEX` statement, parents first.
    pub fn ddl(&self) -> Vec<String> {
        let mut statements = Vec::new();
        for entity in &self.entities {
            statements.push(create_table_sql(&entity.descriptor));
            for index in entity.descriptor.indices() {
                statements.push(create_index_sql(&entity.descriptor, index));
            }
        }
        statements
    }
}

// =============================================================================
// Statement Generation
// =============================================================================

fn create_table_sql(desc: &EntityDescriptor) -> String {
    let mut lines = Vec::new();
    let inline_pk = desc.auto_generate;

    for column in desc.columns() {
        let is_key = desc
            .primary_key
            .iter()
            .any(|k| k.eq_ignore_ascii_case(&column.column));
        let mut line = format!("{} {}", quote_ident(&column.column), column.sql_type.ddl());
        if inline_pk && is_key {
            line.push_str(" PRIMARY KEY AUTOINCREMENT");
        }
        if is_key || !column.nullable {
            line.push_str(" NOT NULL");
        }
        lines.push(line);
    }

    if !inline_pk {
        let keys: Vec<String> = desc.primary_key.iter().map(|k| quote_ident(k)).collect();
        lines.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }

    for fk in desc.foreign_keys() {
        let mut line = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {}",
            quote_ident(&fk.column),
            quote_ident(&fk.parent_table),
            quote_ident(&fk.parent_column),
            fk.on_update.ddl(),
            fk.on_delete.ddl(),
        );
        if fk.deferred {
            line.push_str(" DEFERRABLE INITIALLY DEFERRED");
        }
        lines.push(line);
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(desc.table()),
        lines.join(",\n    ")
    )
}

fn create_index_sql(desc: &EntityDescriptor, index: &IndexDescriptor) -> String {
    let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.resolved_name(desc.table())),
        quote_ident(desc.table()),
        columns.join(", ")
    )
}

fn compile_statements(desc: &EntityDescriptor) -> TableStatements {
    let table = quote_ident(desc.table());
    let all_columns: Vec<String> = desc.columns().iter().map(|c| quote_ident(&c.column)).collect();
    let slots: Vec<String> = (1..=all_columns.len()).map(|i| format!("?{i}")).collect();

    let insert = ConflictPolicy::ALL.map(|policy| {
        format!(
            "{} {} ({}) VALUES ({}){}",
            policy.insert_verb(),
            table,
            all_columns.join(", "),
            slots.join(", "),
            policy.insert_suffix()
        )
    });

    let key_positions = desc.key_positions();
    let mut set_positions: Vec<usize> = (0..desc.columns().len())
        .filter(|i| !key_positions.contains(i))
        .collect();
    if set_positions.is_empty() {
        set_positions = key_positions.clone();
    }

    let key_predicate = |offset: usize| -> String {
        key_positions
            .iter()
            .enumerate()
            .map(|(n, &i)| format!("{} = ?{}", quote_ident(&desc.columns()[i].column), offset + n + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    };

    let assignments: Vec<String> = set_positions
        .iter()
        .enumerate()
        .map(|(n, &i)| format!("{} = ?{}", quote_ident(&desc.columns()[i].column), n + 1))
        .collect();

    let update = format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments.join(", "),
        key_predicate(set_positions.len())
    );
    let mut update_params = set_positions;
    update_params.extend(key_positions.iter().copied());

    let delete = format!("DELETE FROM {} WHERE {}", table, key_predicate(0));
    let select_by_key = format!(
        "SELECT {} FROM {} WHERE {}",
        all_columns.join(", "),
        table,
        key_predicate(0)
    );

    TableStatements {
        insert,
        update,
        update_params,
        delete,
        select_by_key,
    }
}

// =============================================================================
// Installation
// =============================================================================

/// Connection-level settings applied before the schema is installed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pragmas {
    pub wal: bool,
    pub synchronous: &'static str,
}

/// Applies pragmas, creates all tables and indices, and verifies the schema
/// version recorded in the file.
pub(crate) fn install(conn: &Connection, registry: &SchemaRegistry, pragmas: Pragmas) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if pragmas.wal {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "journal mode set");
    }
    conn.pragma_update(None, "synchronous", pragmas.synchronous)?;

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let created = (|| -> Result<()> {
        conn.execute_batch(CREATE_METADATA)?;
        for statement in registry.ddl() {
            conn.execute_batch(&statement)?;
        }
        verify_or_set_version(conn, registry.version())
    })();
    match created {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback, "rollback after failed schema install did not complete");
            }
            return Err(e);
        }
    }

    validate_queries(conn, registry)?;

    info!(
        version = registry.version(),
        tables = registry.entities.len(),
        queries = registry.queries.len(),
        "schema installed"
    );
    Ok(())
}

/// Verifies the schema version, or records it if this is a new database.
fn verify_or_set_version(conn: &Connection, version: u32) -> Result<()> {
    let existing: Option<String> = match conn.query_row(
        "SELECT value FROM spiteorm_metadata WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    ) {
        Ok(v) => Some(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };

    match existing {
        None => {
            conn.execute(
                "INSERT INTO spiteorm_metadata (key, value) VALUES ('schema_version', ?1)",
                [version.to_string()],
            )?;
        }
        Some(v) => {
            let found: u32 = v.parse().map_err(|_| {
                Error::invalid_schema("spiteorm_metadata", format!("stored schema version '{v}' is not a number"))
            })?;
            if found != version {
                return Err(Error::SchemaVersion {
                    expected: version,
                    found,
                });
            }
        }
    }
    Ok(())
}

/// Prepares every registered query and relation fetch against the engine and
/// checks result columns against the declared shapes.
fn validate_queries(conn: &Connection, registry: &SchemaRegistry) -> Result<()> {
    for query in registry.queries() {
        let stmt = conn.prepare(&query.probe_sql()).map_err(|e| {
            Error::invalid_schema(query.name(), format!("does not prepare: {e}"))
        })?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        match query.shape() {
            ResultShape::Affected => {
                if !columns.is_empty() {
                    return Err(Error::invalid_schema(
                        query.name(),
                        "declared as a write but returns rows",
                    ));
                }
            }
            ResultShape::Value => {
                if columns.is_empty() {
                    return Err(Error::invalid_schema(query.name(), "returns no columns"));
                }
            }
            ResultShape::Rows { shape, .. } => {
                mapper::check_coverage(query.name(), shape, &columns)?;
            }
        }
    }

    for relation in registry.relations() {
        let sql = relation.child_sql(registry, 1)?;
        conn.prepare(&sql).map_err(|e| {
            Error::invalid_schema(relation.name(), format!("child fetch does not prepare: {e}"))
        })?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
