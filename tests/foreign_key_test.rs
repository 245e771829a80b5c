//! Foreign Key Tests
//!
//! Referential actions as declared on the test schema:
//! - car.employee_id      CASCADE on delete, deferred
//! - badge.employee_id    RESTRICT on delete
//! - employee.department_id  SET NULL on delete

mod common;

use common::{car, count, department, employee, employee_in, insert_id, memory_db, Badge, Employee};
use spiteorm::{Args, ConflictPolicy, ConstraintKind};

#[test]
fn cascade_removes_children() {
    let mut db = memory_db();
    let driver = insert_id(&mut db, &employee("Driver", 1));
    let other = insert_id(&mut db, &employee("Other", 1));
    db.insert_all(
        &[car("A", 2001, driver), car("B", 2002, driver), car("C", 2003, other)],
        ConflictPolicy::Abort,
    )
    .unwrap();

    let driver_row: Employee = db.find(driver).unwrap().unwrap();
    db.delete(&driver_row).unwrap();

    assert_eq!(count(&db, "car.count"), 1);
}

#[test]
fn cascade_through_write_query() {
    let mut db = memory_db();
    let driver = insert_id(&mut db, &employee("Driver", 1));
    db.insert(&car("A", 2001, driver), ConflictPolicy::Abort).unwrap();

    let removed = db
        .execute("employee.remove", &Args::new().bind_list("ids", [driver]))
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(count(&db, "car.count"), 0);
}

#[test]
fn restrict_rejects_parent_delete() {
    let mut db = memory_db();
    let holder = insert_id(&mut db, &employee("Holder", 1));
    db.insert(
        &Badge {
            code: "B-1".to_string(),
            employee_id: holder,
        },
        ConflictPolicy::Abort,
    )
    .unwrap();

    let holder_row: Employee = db.find(holder).unwrap().unwrap();
    let err = db.delete(&holder_row).unwrap_err();

    assert_eq!(err.constraint_kind(), Some(ConstraintKind::ForeignKey));
    assert!(db.find::<Employee>(holder).unwrap().is_some());
    assert_eq!(count(&db, "badge.count"), 1);
}

#[test]
fn set_null_detaches_children() {
    let mut db = memory_db();
    let sales = insert_id(&mut db, &department("Sales"));
    let seller = insert_id(&mut db, &employee_in("Seller", 10, sales));

    db.execute("department.remove", &Args::new().bind("id", sales))
        .unwrap();

    let seller_row: Employee = db.find(seller).unwrap().unwrap();
    assert_eq!(seller_row.department_id, None);
}

#[test]
fn immediate_key_rejects_missing_parent() {
    let mut db = memory_db();
    let err = db
        .insert(&employee_in("Lost", 1, 404), ConflictPolicy::Abort)
        .unwrap_err();
    assert_eq!(err.constraint_kind(), Some(ConstraintKind::ForeignKey));
    assert_eq!(count(&db, "employee.count"), 0);
}

#[test]
fn deferred_key_rejects_missing_parent_at_commit() {
    let mut db = memory_db();
    let err = db.insert(&car("Orphan", 1999, 404), ConflictPolicy::Abort).unwrap_err();
    assert_eq!(err.constraint_kind(), Some(ConstraintKind::ForeignKey));
    assert_eq!(count(&db, "car.count"), 0);
}

#[test]
fn ddl_declares_actions() {
    let db = memory_db();
    let ddl = db.schema().ddl().join("\n");
    assert!(ddl.contains("ON DELETE CASCADE"));
    assert!(ddl.contains("ON DELETE RESTRICT"));
    assert!(ddl.contains("ON DELETE SET NULL"));
    assert!(ddl.contains("DEFERRABLE INITIALLY DEFERRED"));
}
