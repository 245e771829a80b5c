//! Transaction Atomicity Tests
//!
//! Tests the invariants around units of work:
//! - Every write of a failed unit is rolled back, including earlier successes
//! - Nested units join the outer transaction
//! - A swallowed nested failure still prevents the commit
//! - A swallowed statement failure still prevents the commit
//! - Deferred foreign keys are checked at commit

mod common;

use common::{car, count, employee, insert_id, memory_db, open_db, Employee};
use spiteorm::{Args, ConflictPolicy, ConstraintKind, Database, Error, Value};

#[test]
fn failed_unit_leaves_nothing() {
    let mut db = memory_db();

    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("A", 1), ConflictPolicy::Abort)?;
            tx.insert(&employee("B", 2), ConflictPolicy::Abort)?;
            Err::<(), _>(Error::UnknownQuery("forced failure".to_string()))
        })
        .unwrap_err();

    assert!(matches!(err, Error::TransactionAborted { .. }));
    assert!(matches!(err.root(), Error::UnknownQuery(_)));
    assert_eq!(count(&db, "employee.count"), 0);
}

#[test]
fn constraint_failure_rolls_back_earlier_writes() {
    let mut db = memory_db();
    db.insert(
        &Employee {
            id: 5,
            ..employee("Existing", 1)
        },
        ConflictPolicy::Abort,
    )
    .unwrap();

    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("New", 2), ConflictPolicy::Abort)?;
            tx.insert(
                &Employee {
                    id: 5,
                    ..employee("Clash", 3)
                },
                ConflictPolicy::Abort,
            )?;
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.root().constraint_kind(), Some(ConstraintKind::PrimaryKey));
    assert_eq!(count(&db, "employee.count"), 1);
}

#[test]
fn successful_unit_commits_everything() {
    let mut db = memory_db();
    let ids = db
        .run_atomically(|tx| {
            let a = tx.insert(&employee("A", 1), ConflictPolicy::Abort)?;
            let b = tx.insert(&employee("B", 2), ConflictPolicy::Abort)?;
            Ok((a, b))
        })
        .unwrap();
    assert!(ids.0.is_some() && ids.1.is_some());
    assert_eq!(count(&db, "employee.count"), 2);
}

#[test]
fn reads_inside_unit_see_its_writes() {
    let mut db = memory_db();
    db.run_atomically(|tx| {
        let id = tx.insert(&employee("A", 1), ConflictPolicy::Abort)?.unwrap_or_default();
        assert!(tx.find::<Employee>(id)?.is_some());
        assert_eq!(tx.fetch_value::<i64>("employee.count", &Args::new())?, Some(1));
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_units_join_the_outer_transaction() {
    let mut db = memory_db();
    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("Outer", 1), ConflictPolicy::Abort)?;
            tx.run_atomically(|inner| {
                assert_eq!(inner.depth(), 1);
                inner.insert(&employee("Inner", 2), ConflictPolicy::Abort)
            })?;
            Err::<(), _>(Error::UnknownQuery("outer fails after inner succeeded".to_string()))
        })
        .unwrap_err();

    assert!(matches!(err.root(), Error::UnknownQuery(_)));
    // The inner unit's write goes with the outer rollback.
    assert_eq!(count(&db, "employee.count"), 0);
}

#[test]
fn swallowed_nested_failure_prevents_commit() {
    let mut db = memory_db();
    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("Outer", 1), ConflictPolicy::Abort)?;
            let inner = tx.run_atomically(|_| Err::<(), _>(Error::UnknownQuery("inner".to_string())));
            assert!(inner.is_err());
            assert!(tx.is_rollback_only());
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err.root(), Error::RollbackOnly(_)));
    assert_eq!(count(&db, "employee.count"), 0);
}

#[test]
fn swallowed_key_collision_prevents_commit() {
    let mut db = memory_db();
    db.insert(
        &Employee {
            id: 5,
            ..employee("Existing", 1)
        },
        ConflictPolicy::Abort,
    )
    .unwrap();

    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("New", 2), ConflictPolicy::Abort)?;
            let clash = tx.insert(
                &Employee {
                    id: 5,
                    ..employee("Clash", 3)
                },
                ConflictPolicy::Abort,
            );
            assert_eq!(clash.unwrap_err().constraint_kind(), Some(ConstraintKind::PrimaryKey));
            assert!(tx.is_rollback_only());
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err.root(), Error::RollbackOnly(_)));
    assert_eq!(count(&db, "employee.count"), 1);
}

#[test]
fn swallowed_write_query_failure_prevents_commit() {
    let mut db = memory_db();
    let id = insert_id(&mut db, &employee("Ann", 1));

    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("Bob", 2), ConflictPolicy::Abort)?;
            let failed = tx.execute(
                "employee.set_salary",
                &Args::new().bind("salary", Value::Null).bind_list("ids", [id]),
            );
            assert_eq!(failed.unwrap_err().constraint_kind(), Some(ConstraintKind::NotNull));
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err.root(), Error::RollbackOnly(_)));
    assert_eq!(count(&db, "employee.count"), 1);
}

#[test]
fn argument_errors_leave_unit_committable() {
    let mut db = memory_db();
    db.run_atomically(|tx| {
        tx.insert(&employee("Kept", 1), ConflictPolicy::Abort)?;
        assert!(tx.execute("employee.nope", &Args::new()).is_err());
        assert!(!tx.is_rollback_only());
        Ok(())
    })
    .unwrap();
    assert_eq!(count(&db, "employee.count"), 1);
}

#[test]
fn deferred_foreign_key_allows_any_insert_order() {
    let mut db = memory_db();
    // The car references an employee that does not exist yet.
    db.run_atomically(|tx| {
        tx.insert(&car("Volvo 240", 1991, 100), ConflictPolicy::Abort)?;
        tx.insert(
            &Employee {
                id: 100,
                ..employee("Driver", 1)
            },
            ConflictPolicy::Abort,
        )?;
        Ok(())
    })
    .unwrap();

    assert_eq!(count(&db, "car.count"), 1);
}

#[test]
fn deferred_foreign_key_fails_at_commit() {
    let mut db = memory_db();
    let err = db
        .run_atomically(|tx| {
            tx.insert(&employee("Someone", 1), ConflictPolicy::Abort)?;
            tx.insert(&car("Ghost", 2000, 999), ConflictPolicy::Abort)?;
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.root().constraint_kind(), Some(ConstraintKind::ForeignKey));
    assert_eq!(count(&db, "car.count"), 0);
    assert_eq!(count(&db, "employee.count"), 0);

    // The connection is usable again.
    insert_id(&mut db, &employee("After", 1));
}

#[test]
fn tracks_written_tables_with_cascades() {
    let mut db = memory_db();
    let id = insert_id(&mut db, &employee("Driver", 1));
    db.insert(&car("Lada", 1980, id), ConflictPolicy::Abort).unwrap();

    let written = db
        .run_atomically(|tx| {
            tx.execute("employee.remove", &Args::new().bind_list("ids", [id]))?;
            Ok(tx.written_tables().clone())
        })
        .unwrap();
    assert!(written.contains("employee"));
    assert!(written.contains("car"));
}

#[test]
fn committed_unit_survives_reopen() {
    let (dir, mut db) = open_db("durable.db");
    db.run_atomically(|tx| {
        tx.insert(&employee("A", 1), ConflictPolicy::Abort)?;
        tx.insert(&employee("B", 2), ConflictPolicy::Abort)?;
        Ok(())
    })
    .unwrap();
    drop(db);

    let db = Database::open(dir.path().join("durable.db"), common::schema()).unwrap();
    assert_eq!(count(&db, "employee.count"), 2);
}
