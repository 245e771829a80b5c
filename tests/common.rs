#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use spiteorm::{
    Args, ColumnDef, ConflictPolicy, Database, EmbeddedDef, Entity, ForeignKeyAction, ForeignKeyDescriptor, FromRow,
    IndexDescriptor, QueryDescriptor, RelationSpec, Result, Row, RowShape, SchemaRegistry, TableDef, ToValue, Value,
};

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Department {
    pub id: i64,
    pub name: String,
}

impl FromRow for Department {
    fn shape() -> RowShape {
        Self::table().row_shape()
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Department {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }
}

impl Entity for Department {
    fn table() -> TableDef {
        TableDef::new("department")
            .column(ColumnDef::integer("id"))
            .column(ColumnDef::text("name"))
            .auto_increment("id")
            .index(IndexDescriptor::new(["name"]).unique())
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![self.id.to_value()?, self.name.to_value()?])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Employee {
    pub id: i64,
    pub name: Option<String>,
    pub salary: i64,
    pub department_id: Option<i64>,
}

impl FromRow for Employee {
    fn shape() -> RowShape {
        Self::table().row_shape()
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Employee {
            id: row.get("id")?,
            name: row.get("name")?,
            salary: row.get("salary")?,
            department_id: row.get("department_id")?,
        })
    }
}

impl Entity for Employee {
    fn table() -> TableDef {
        TableDef::new("employee")
            .column(ColumnDef::integer("id"))
            .column(ColumnDef::text("name").nullable())
            .column(ColumnDef::integer("salary"))
            .column(ColumnDef::integer("department_id").nullable())
            .auto_increment("id")
            .foreign_key(
                ForeignKeyDescriptor::new("department_id", "department", "id").on_delete(ForeignKeyAction::SetNull),
            )
            .index(IndexDescriptor::new(["salary"]))
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            self.id.to_value()?,
            self.name.to_value()?,
            self.salary.to_value()?,
            self.department_id.to_value()?,
        ])
    }
}

/// Car rows follow their employee on delete; the key is checked at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Car {
    pub id: i64,
    pub model: String,
    pub year: i64,
    pub employee_id: i64,
}

impl FromRow for Car {
    fn shape() -> RowShape {
        Self::table().row_shape()
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Car {
            id: row.get("id")?,
            model: row.get("model")?,
            year: row.get("year")?,
            employee_id: row.get("employee_id")?,
        })
    }
}

impl Entity for Car {
    fn table() -> TableDef {
        TableDef::new("car")
            .column(ColumnDef::integer("id"))
            .column(ColumnDef::text("model"))
            .column(ColumnDef::integer("year"))
            .column(ColumnDef::integer("employee_id"))
            .auto_increment("id")
            .foreign_key(
                ForeignKeyDescriptor::new("employee_id", "employee", "id")
                    .on_delete(ForeignKeyAction::Cascade)
                    .deferred(),
            )
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            self.id.to_value()?,
            self.model.to_value()?,
            self.year.to_value()?,
            self.employee_id.to_value()?,
        ])
    }
}

/// Badges block deleting their employee and are keyed by a text code.
#[derive(Debug, Clone, PartialEq)]
pub struct Badge {
    pub code: String,
    pub employee_id: i64,
}

impl FromRow for Badge {
    fn shape() -> RowShape {
        Self::table().row_shape()
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Badge {
            code: row.get("code")?,
            employee_id: row.get("employee_id")?,
        })
    }
}

impl Entity for Badge {
    fn table() -> TableDef {
        TableDef::new("badge")
            .column(ColumnDef::text("code"))
            .column(ColumnDef::integer("employee_id"))
            .primary_key(["code"])
            .foreign_key(
                ForeignKeyDescriptor::new("employee_id", "employee", "id").on_delete(ForeignKeyAction::Restrict),
            )
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![self.code.to_value()?, self.employee_id.to_value()?])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Name {
    pub first: String,
    pub last: Option<String>,
}

/// A contact stores its name as an embedded group of columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub name: Name,
    pub email: String,
}

impl FromRow for Contact {
    fn shape() -> RowShape {
        Self::table().row_shape()
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Contact {
            id: row.get("id")?,
            name: Name {
                first: row.get("first_name")?,
                last: row.get("last_name")?,
            },
            email: row.get("email")?,
        })
    }
}

impl Entity for Contact {
    fn table() -> TableDef {
        TableDef::new("contact")
            .column(ColumnDef::integer("id"))
            .embedded(
                EmbeddedDef::new("name")
                    .column(ColumnDef::text("first").column_name("first_name"))
                    .column(ColumnDef::text("last").column_name("last_name").nullable()),
            )
            .column(ColumnDef::text("email"))
            .auto_increment("id")
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            self.id.to_value()?,
            self.name.first.to_value()?,
            self.name.last.to_value()?,
            self.email.to_value()?,
        ])
    }
}

// =============================================================================
// Projections
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NameAndSalary {
    pub name: Option<String>,
    pub salary: i64,
}

impl FromRow for NameAndSalary {
    fn shape() -> RowShape {
        RowShape::new().optional("name").required("salary")
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(NameAndSalary {
            name: row.get("name")?,
            salary: row.get("salary")?,
        })
    }
}

// =============================================================================
// Schema
// =============================================================================

pub fn schema() -> SchemaRegistry {
    schema_version(1)
}

pub fn schema_version(version: u32) -> SchemaRegistry {
    let mut schema = SchemaRegistry::new(version);
    schema.register::<Department>().expect("register department");
    schema.register::<Employee>().expect("register employee");
    schema.register::<Car>().expect("register car");
    schema.register::<Badge>().expect("register badge");
    schema.register::<Contact>().expect("register contact");

    let queries = [
        QueryDescriptor::many::<Employee>("employee.all", "SELECT * FROM employee ORDER BY id"),
        QueryDescriptor::one::<Employee>("employee.by_id", "SELECT * FROM employee WHERE id = :id"),
        QueryDescriptor::many::<Employee>(
            "employee.salary_above",
            "SELECT * FROM employee WHERE salary > :min_salary ORDER BY id",
        ),
        QueryDescriptor::many::<Employee>(
            "employee.salary_between",
            "SELECT * FROM employee WHERE salary BETWEEN :min_salary AND :max_salary ORDER BY id",
        ),
        QueryDescriptor::many::<Employee>("employee.by_ids", "SELECT * FROM employee WHERE id IN (:ids) ORDER BY id"),
        QueryDescriptor::many::<NameAndSalary>("employee.names", "SELECT name, salary FROM employee ORDER BY id"),
        QueryDescriptor::value("employee.count", "SELECT COUNT(*) FROM employee"),
        QueryDescriptor::value("employee.max_salary", "SELECT MAX(salary) FROM employee"),
        QueryDescriptor::affected("employee.set_salary", "UPDATE employee SET salary = :salary WHERE id IN (:ids)"),
        QueryDescriptor::affected("employee.remove", "DELETE FROM employee WHERE id IN (:ids)"),
        QueryDescriptor::many::<Car>("car.all", "SELECT * FROM car ORDER BY id"),
        QueryDescriptor::value("car.count", "SELECT COUNT(*) FROM car"),
        QueryDescriptor::value("badge.count", "SELECT COUNT(*) FROM badge"),
        QueryDescriptor::many::<Department>("department.all", "SELECT id, name FROM department ORDER BY id"),
        QueryDescriptor::affected("department.remove", "DELETE FROM department WHERE id = :id"),
        QueryDescriptor::many::<Contact>("contact.all", "SELECT * FROM contact ORDER BY id"),
    ];
    for query in queries {
        schema.register_query(query).expect("register query");
    }

    schema
        .register_relation(
            RelationSpec::new("department.employees", "department", "id", "employee", "department_id")
                .project(["name", "salary", "department_id"]),
        )
        .expect("register relation");
    schema
        .register_relation(RelationSpec::new("employee.cars", "employee", "id", "car", "employee_id"))
        .expect("register relation");
    schema
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn open_db(name: &str) -> (tempfile::TempDir, Database) {
    let (dir, path) = temp_db_path(name);
    let db = Database::open(&path, schema()).expect("open database");
    (dir, db)
}

pub fn memory_db() -> Database {
    Database::open_in_memory(schema()).expect("open in-memory database")
}

pub fn department(name: &str) -> Department {
    Department {
        id: 0,
        name: name.to_string(),
    }
}

pub fn employee(name: &str, salary: i64) -> Employee {
    Employee {
        id: 0,
        name: Some(name.to_string()),
        salary,
        department_id: None,
    }
}

pub fn employee_in(name: &str, salary: i64, department_id: i64) -> Employee {
    Employee {
        department_id: Some(department_id),
        ..employee(name, salary)
    }
}

pub fn car(model: &str, year: i64, employee_id: i64) -> Car {
    Car {
        id: 0,
        model: model.to_string(),
        year,
        employee_id,
    }
}

/// Inserts and returns the assigned row id.
pub fn insert_id<E: Entity>(db: &mut Database, entity: &E) -> i64 {
    db.insert(entity, ConflictPolicy::Abort)
        .expect("insert")
        .expect("row inserted")
}

pub fn count(db: &Database, query: &str) -> i64 {
    db.fetch_value::<i64>(query, &Args::new())
        .expect("count query")
        .unwrap_or(0)
}

pub async fn eventually<T>(timeout: Duration, interval: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
