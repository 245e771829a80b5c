//! Async API Tests
//!
//! The async handle over a file database: writes on the writer thread, reads
//! on the reader pool, live queries fed from the writer.

mod common;

use std::time::Duration;

use common::{car, department, employee, employee_in, temp_db_path, Car, Department, Employee};
use futures::StreamExt;
use spiteorm::{Args, AsyncDatabase, ConflictPolicy, ConstraintKind, DatabaseConfig, Error, LiveResult};

async fn open(name: &str) -> (tempfile::TempDir, AsyncDatabase) {
    let (dir, path) = temp_db_path(name);
    let db = AsyncDatabase::open_with_config(&path, common::schema(), DatabaseConfig::default().with_reader_threads(2))
        .await
        .unwrap();
    (dir, db)
}

async fn employee_count(db: &AsyncDatabase) -> i64 {
    db.fetch_value::<i64>("employee.count", Args::new())
        .await
        .unwrap()
        .unwrap_or(0)
}

#[tokio::test]
async fn reads_observe_committed_writes() {
    let (_dir, db) = open("async_reads.db").await;
    assert_eq!(db.reader_count(), 2);

    let id = db
        .insert(employee("Ann", 7200), ConflictPolicy::Abort)
        .await
        .unwrap()
        .unwrap();
    let found: Option<Employee> = db.find(id).await.unwrap();
    assert_eq!(found.unwrap().name.as_deref(), Some("Ann"));

    db.shutdown().await;
}

#[tokio::test]
async fn concurrent_writers_all_commit() {
    let (_dir, db) = open("async_concurrent.db").await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.insert(employee(&format!("E{i}"), i), ConflictPolicy::Abort).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(employee_count(&db).await, 20);
    db.shutdown().await;
}

#[tokio::test]
async fn transaction_closure_runs_on_writer() {
    let (_dir, db) = open("async_tx.db").await;

    db.run_atomically(|tx| {
        tx.insert(&car("Volvo", 1991, 100), ConflictPolicy::Abort)?;
        tx.insert(
            &Employee {
                id: 100,
                ..employee("Driver", 1)
            },
            ConflictPolicy::Abort,
        )?;
        Ok(())
    })
    .await
    .unwrap();

    let cars: Vec<Car> = db.fetch_many("car.all", Args::new()).await.unwrap();
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].employee_id, 100);

    let err = db
        .run_atomically(|tx| {
            tx.insert(&car("Ghost", 2000, 999), ConflictPolicy::Abort)?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.root().constraint_kind(), Some(ConstraintKind::ForeignKey));

    db.shutdown().await;
}

#[tokio::test]
async fn transaction_closure_owns_captured_keys() {
    let (_dir, db) = open("async_tx_capture.db").await;
    let sales = db
        .insert(department("Sales"), ConflictPolicy::Abort)
        .await
        .unwrap()
        .unwrap();

    let hires = vec![employee_in("S1", 10, sales), employee_in("S2", 20, sales)];
    let ids = db
        .run_atomically(move |tx| tx.insert_all(&hires, ConflictPolicy::Abort))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let staff: Vec<Employee> = db.fetch_many("employee.all", Args::new()).await.unwrap();
    assert!(staff.iter().all(|e| e.department_id == Some(sales)));
    db.shutdown().await;
}

#[tokio::test]
async fn write_queries_and_batches() {
    let (_dir, db) = open("async_batches.db").await;
    let ids = db
        .insert_all(vec![employee("A", 1), employee("B", 2), employee("C", 3)], ConflictPolicy::Abort)
        .await
        .unwrap();
    let ids: Vec<i64> = ids.into_iter().flatten().collect();

    let changed = db
        .execute(
            "employee.set_salary",
            Args::new().bind("salary", 50).bind_list("ids", ids.clone()),
        )
        .await
        .unwrap();
    assert_eq!(changed, 3);

    let staff: Vec<Employee> = db.fetch_many("employee.all", Args::new()).await.unwrap();
    assert!(staff.iter().all(|e| e.salary == 50));

    assert_eq!(db.delete_all(staff).await.unwrap(), 3);
    assert_eq!(employee_count(&db).await, 0);
    db.shutdown().await;
}

#[tokio::test]
async fn relations_through_reader_pool() {
    let (_dir, db) = open("async_relations.db").await;
    let sales = db
        .insert(department("Sales"), ConflictPolicy::Abort)
        .await
        .unwrap()
        .unwrap();
    db.insert_all(
        vec![employee_in("S1", 1, sales), employee_in("S2", 2, sales)],
        ConflictPolicy::Abort,
    )
    .await
    .unwrap();

    let expanded = db
        .fetch_with_relations::<Department>("department.all", Args::new(), vec!["department.employees".to_string()])
        .await
        .unwrap();
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].rows("department.employees").len(), 2);
    db.shutdown().await;
}

#[tokio::test]
async fn live_query_follows_async_writes() {
    let (_dir, db) = open("async_live.db").await;
    let mut live = db
        .observe_many::<Employee>("employee.salary_above", Args::new().bind("min_salary", 5000))
        .await
        .unwrap();
    assert!(matches!(live.next().await, Some(LiveResult::Value(ref v)) if v.is_empty()));

    db.insert(employee("Low", 100), ConflictPolicy::Abort).await.unwrap();
    db.insert(employee("High", 9000), ConflictPolicy::Abort).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .expect("delivery within timeout");
    match next {
        Some(LiveResult::Value(list)) => {
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].salary, 9000);
        }
        other => panic!("unexpected delivery {other:?}"),
    }

    live.cancel();
    assert_eq!(db.active_subscriptions().await.unwrap(), 0);
    db.shutdown().await;
}

#[tokio::test]
async fn absent_row_through_async_handle() {
    let db = AsyncDatabase::open_in_memory(common::schema()).await.unwrap();
    let missing: Option<Employee> = db.fetch_one("employee.by_id", Args::new().bind("id", 1)).await.unwrap();
    assert!(missing.is_none());

    let mut live = db
        .observe_one::<Employee>("employee.by_id", Args::new().bind("id", 1))
        .await
        .unwrap();
    assert!(live.next().await.map(|r| r.is_absent()).unwrap_or(false));
}

#[tokio::test]
async fn file_is_leased_until_shutdown() {
    let (_dir, path) = temp_db_path("async_lease.db");
    let db = AsyncDatabase::open(&path, common::schema()).await.unwrap();

    let err = AsyncDatabase::open(&path, common::schema()).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyOpen(_)));

    db.shutdown().await;
    let reopened = AsyncDatabase::open(&path, common::schema()).await.unwrap();
    reopened.shutdown().await;
}

#[tokio::test]
async fn calls_after_shutdown_fail() {
    let (_dir, db) = open("async_closed.db").await;
    let handle = db.clone();
    db.shutdown().await;

    let err = handle
        .insert(employee("Late", 1), ConflictPolicy::Abort)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerClosed(_)));
}
