//! Isolation scenarios
//!
//! Write skew: two transactions each read the cell the other writes.
//! Snapshot isolation lets both commit when their prepare windows overlap;
//! serializable isolation and `ensure()` make the second one conflict.

use crate::common::*;
use strata_stm::{IsolationLevel, StmError, TxnConfig, TxnRef};

struct OnCall {
    alice: TxnRef<bool>,
    bob: TxnRef<bool>,
}

impl OnCall {
    fn new() -> Self {
        OnCall {
            alice: TxnRef::new(true),
            bob: TxnRef::new(true),
        }
    }
}

#[test]
fn snapshot_allows_write_skew_with_overlapping_prepare() {
    let stm = stm();
    let doctors = OnCall::new();

    let mut t1 = stm.begin_transaction();
    let mut t2 = stm.begin_transaction();
    assert!(doctors.bob.read(&mut t1).unwrap());
    assert!(doctors.alice.read(&mut t2).unwrap());
    doctors.alice.write(&mut t1, false).unwrap();
    doctors.bob.write(&mut t2, false).unwrap();

    t1.prepare().unwrap();
    t2.prepare().unwrap();
    stm.commit(&mut t1).unwrap();
    stm.commit(&mut t2).unwrap();

    // Nobody is on call any more
    assert!(!doctors.alice.atomic_get().unwrap());
    assert!(!doctors.bob.atomic_get().unwrap());
}

#[test]
fn serializable_prevents_write_skew() {
    let stm = stm();
    let doctors = OnCall::new();
    let serializable = TxnConfig::new().with_isolation_level(IsolationLevel::Serializable);

    let mut t1 = stm.begin_transaction_with(serializable.clone());
    let mut t2 = stm.begin_transaction_with(serializable);
    doctors.bob.read(&mut t1).unwrap();
    doctors.alice.read(&mut t2).unwrap();
    doctors.alice.write(&mut t1, false).unwrap();
    doctors.bob.write(&mut t2, false).unwrap();

    t1.prepare().unwrap();
    assert!(matches!(t2.prepare(), Err(StmError::Conflict { .. })));
    stm.commit(&mut t1).unwrap();

    assert!(!doctors.alice.atomic_get().unwrap());
    assert!(doctors.bob.atomic_get().unwrap());
}

#[test]
fn ensure_prevents_write_skew_under_snapshot() {
    let stm = stm();
    let doctors = OnCall::new();

    let mut t1 = stm.begin_transaction();
    let mut t2 = stm.begin_transaction();
    doctors.bob.read(&mut t1).unwrap();
    doctors.bob.ensure(&mut t1).unwrap();
    doctors.alice.read(&mut t2).unwrap();
    doctors.alice.ensure(&mut t2).unwrap();
    doctors.alice.write(&mut t1, false).unwrap();
    doctors.bob.write(&mut t2, false).unwrap();

    t1.prepare().unwrap();
    assert!(matches!(t2.prepare(), Err(StmError::Conflict { .. })));
    stm.commit(&mut t1).unwrap();

    assert!(doctors.alice.atomic_get().unwrap() || doctors.bob.atomic_get().unwrap());
}

#[test]
fn sequential_skew_is_a_plain_conflict() {
    let stm = stm();
    let doctors = OnCall::new();

    let mut t1 = stm.begin_transaction();
    let mut t2 = stm.begin_transaction();
    doctors.bob.read(&mut t1).unwrap();
    doctors.alice.read(&mut t2).unwrap();
    doctors.alice.write(&mut t1, false).unwrap();
    doctors.bob.write(&mut t2, false).unwrap();

    stm.commit(&mut t1).unwrap();
    assert!(matches!(
        stm.commit(&mut t2),
        Err(StmError::Conflict { .. })
    ));
    assert!(doctors.bob.atomic_get().unwrap());
}

#[test]
fn readonly_transaction_rejects_writes() {
    let stm = stm();
    let cell = TxnRef::new(1u8);
    let readonly = TxnConfig::new().with_readonly(true);

    let result = stm.atomic_with(readonly, |tx| {
        let value = cell.read(tx)?;
        cell.write(tx, value + 1)
    });

    assert!(matches!(result, Err(StmError::ReadonlyViolation { .. })));
    assert_eq!(cell.atomic_get().unwrap(), 1);
}
