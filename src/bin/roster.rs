//! Roster demo binary
//!
//! Walks through a small staff database: departments, employees and company
//! cars. Run with: `cargo run --bin roster -- [--db PATH]`
//!
//! Without `--db` the database lives in memory. Set `RUST_LOG=spiteorm=debug`
//! to watch transactions and live-query refreshes.
//!
//! # Examples
//!
//! ```bash
//! cargo run --bin roster
//! RUST_LOG=debug cargo run --bin roster -- --db /tmp/roster.db
//! ```

use spiteorm::{
    Args, AsyncDatabase, ColumnDef, ConflictPolicy, Entity, Error, ForeignKeyAction, ForeignKeyDescriptor, FromRow,
    IndexDescriptor, LiveResult, QueryDescriptor, RelationSpec, Result, Row, RowShape, SchemaRegistry, TableDef,
    ToValue, Value,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Department {
    id: i64,
    name: String,
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
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![self.id.to_value()?, self.name.to_value()?])
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Employee {
    id: i64,
    name: Option<String>,
    salary: i64,
    department_id: Option<i64>,
}

impl Employee {
    fn new(name: &str, salary: i64, department_id: Option<i64>) -> Self {
        Employee {
            id: 0,
            name: Some(name.to_string()),
            salary,
            department_id,
        }
    }
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

/// Every car belongs to an employee. The key is checked at commit, so a car
/// and its driver can be inserted in either order inside one transaction.
#[derive(Debug, Clone, PartialEq)]
struct Car {
    id: i64,
    model: String,
    year: i64,
    employee_id: i64,
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

// =============================================================================
// Projections
// =============================================================================

#[derive(Debug)]
struct NameAndSalary {
    name: Option<String>,
    salary: i64,
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

#[derive(Debug)]
struct EmployeeDepartment {
    name: Option<String>,
    salary: i64,
    department_name: String,
}

impl FromRow for EmployeeDepartment {
    fn shape() -> RowShape {
        RowShape::new()
            .optional("name")
            .required("salary")
            .required("department_name")
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(EmployeeDepartment {
            name: row.get("name")?,
            salary: row.get("salary")?,
            department_name: row.get("department_name")?,
        })
    }
}

// =============================================================================
// Schema
// =============================================================================

fn schema() -> Result<SchemaRegistry> {
    let mut schema = SchemaRegistry::new(1);
    schema.register::<Department>()?;
    schema.register::<Employee>()?;
    schema.register::<Car>()?;

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
        QueryDescriptor::affected("employee.set_salary", "UPDATE employee SET salary = :salary WHERE id IN (:ids)"),
        QueryDescriptor::affected("employee.remove", "DELETE FROM employee WHERE id IN (:ids)"),
        QueryDescriptor::many::<EmployeeDepartment>(
            "employee.with_department",
            "SELECT e.name, e.salary, d.name AS department_name \
             FROM employee e JOIN department d ON e.department_id = d.id ORDER BY e.id",
        ),
        QueryDescriptor::many::<Department>("department.all", "SELECT id, name FROM department ORDER BY id"),
        QueryDescriptor::value("car.count", "SELECT COUNT(*) FROM car"),
    ];
    for query in queries {
        schema.register_query(query)?;
    }

    schema.register_relation(
        RelationSpec::new("department.employees", "department", "id", "employee", "department_id")
            .project(["name", "salary", "department_id"]),
    )?;
    Ok(schema)
}

// =============================================================================
// Main
// =============================================================================

fn parse_args() -> Result<Option<String>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => Ok(None),
        [flag, path] if flag == "--db" || flag == "-d" => Ok(Some(path.clone())),
        other => Err(Error::Config(format!("usage: roster [--db PATH], got {other:?}"))),
    }
}

fn print_employees(title: &str, employees: &[Employee]) {
    println!("{title}:");
    for e in employees {
        println!(
            "  #{:<3} {:<10} {:>6}",
            e.id,
            e.name.as_deref().unwrap_or("<unnamed>"),
            e.salary
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let db = match parse_args()? {
        Some(path) => AsyncDatabase::open(&path, schema()?).await?,
        None => AsyncDatabase::open_in_memory(schema()?).await?,
    };
    info!(readers = db.reader_count(), "roster database ready");

    // Departments and staff.
    let departments = db
        .insert_all(
            vec![
                Department { id: 0, name: "Engineering".to_string() },
                Department { id: 0, name: "Sales".to_string() },
                Department { id: 0, name: "Legal".to_string() },
            ],
            ConflictPolicy::Abort,
        )
        .await?;
    let &[Some(engineering), Some(sales), _] = departments.as_slice() else {
        return Err(Error::Config("departments were not inserted".to_string()));
    };

    let mut rich = db
        .observe_many::<Employee>("employee.salary_above", Args::new().bind("min_salary", 5000))
        .await?;
    if let Some(LiveResult::Value(list)) = rich.next().await {
        println!("live: {} employees earn more than 5000", list.len());
    }

    db.insert_all(
        vec![
            Employee::new("Ann", 7200, Some(engineering)),
            Employee::new("Boris", 4100, Some(engineering)),
            Employee::new("Clara", 3900, Some(sales)),
        ],
        ConflictPolicy::Abort,
    )
    .await?;
    if let Some(LiveResult::Value(list)) = rich.next().await {
        print_employees("live: salary above 5000", &list);
    }

    // A car and its driver in one transaction; the car goes first.
    db.run_atomically(move |tx| {
        tx.insert(
            &Car { id: 0, model: "Volvo 240".to_string(), year: 1991, employee_id: 100 },
            ConflictPolicy::Abort,
        )?;
        tx.insert(
            &Employee { id: 100, name: Some("Dmitri".to_string()), salary: 6100, department_id: Some(sales) },
            ConflictPolicy::Abort,
        )?;
        Ok(())
    })
    .await?;
    let cars: Option<i64> = db.fetch_value("car.count", Args::new()).await?;
    println!("cars after transaction: {}", cars.unwrap_or(0));

    // Replace keeps one row per key.
    db.insert(
        Employee { id: 100, name: Some("Dmitri".to_string()), salary: 6500, department_id: Some(sales) },
        ConflictPolicy::Replace,
    )
    .await?;

    let between: Vec<Employee> = db
        .fetch_many(
            "employee.salary_between",
            Args::new().bind("min_salary", 4000).bind("max_salary", 7000),
        )
        .await?;
    print_employees("salary between 4000 and 7000", &between);

    let updated = db
        .execute(
            "employee.set_salary",
            Args::new().bind("salary", 5500).bind_list("ids", [1_i64, 2]),
        )
        .await?;
    println!("salary updated for {updated} employees");

    let picked: Vec<Employee> = db
        .fetch_many("employee.by_ids", Args::new().bind_list("ids", [1_i64, 2, 3]))
        .await?;
    print_employees("by id list", &picked);

    for row in db
        .fetch_many::<EmployeeDepartment>("employee.with_department", Args::new())
        .await?
    {
        println!(
            "  {:<10} {:>6}  {}",
            row.name.as_deref().unwrap_or("<unnamed>"),
            row.salary,
            row.department_name
        );
    }

    let staffed = db
        .fetch_with_relations::<Department>(
            "department.all",
            Args::new(),
            vec!["department.employees".to_string()],
        )
        .await?;
    for expanded in staffed {
        let staff = expanded.children::<NameAndSalary>("department.employees")?;
        let names: Vec<String> = staff
            .iter()
            .map(|e| format!("{} ({})", e.name.as_deref().unwrap_or("<unnamed>"), e.salary))
            .collect();
        println!("{}: [{}]", expanded.parent.name, names.join(", "));
    }

    // Removing the driver removes the car too.
    let removed = db.execute("employee.remove", Args::new().bind_list("ids", [100_i64])).await?;
    let cars: Option<i64> = db.fetch_value("car.count", Args::new()).await?;
    println!("removed {removed} employee; cars left: {}", cars.unwrap_or(0));

    // A missing row is reported as absent, both once and live.
    let missing: Option<Employee> = db.fetch_one("employee.by_id", Args::new().bind("id", 999)).await?;
    println!("employee 999 present: {}", missing.is_some());
    let mut watch = db
        .observe_one::<Employee>("employee.by_id", Args::new().bind("id", 999))
        .await?;
    if let Some(result) = watch.next().await {
        println!("live employee 999 absent: {}", result.is_absent());
    }
    watch.cancel();
    rich.cancel();

    db.shutdown().await;
    Ok(())
}
