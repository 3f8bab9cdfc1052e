//! Blocking retry scenarios
//!
//! - A waiter wakes exactly when a cell it read changes
//! - Writes to cells it did not read leave it parked
//! - Deadlines surface as `Timeout`

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_stm::{guard, StmBuilder, StmError, TxnRef};

#[test]
fn waiter_wakes_on_read_cell_change_only() {
    let stm = stm();
    let ready = TxnRef::new(false);
    let noise = TxnRef::new(0u32);
    let attempts = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let stm = Arc::clone(&stm);
        let ready = ready.clone();
        let attempts = Arc::clone(&attempts);
        thread::spawn(move || {
            stm.atomic(|tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let ok = ready.read(tx)?;
                guard(ok)
            })
        })
    };

    thread::sleep(Duration::from_millis(30));
    for i in 0..5 {
        stm.atomic(|tx| noise.write(tx, i)).unwrap();
    }
    thread::sleep(Duration::from_millis(30));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    stm.atomic(|tx| ready.write(tx, true)).unwrap();
    waiter.join().unwrap().unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(stm.metrics().total_retries, 1);
}

#[test]
fn waiter_on_several_cells_wakes_on_any() {
    let stm = stm();
    let left = TxnRef::new(0u32);
    let right = TxnRef::new(0u32);

    let waiter = {
        let stm = Arc::clone(&stm);
        let (left, right) = (left.clone(), right.clone());
        thread::spawn(move || {
            stm.atomic(|tx| {
                let sum = left.read(tx)? + right.read(tx)?;
                guard(sum > 0)?;
                Ok(sum)
            })
        })
    };

    thread::sleep(Duration::from_millis(20));
    right.atomic_set(4).unwrap();

    assert_eq!(waiter.join().unwrap(), Ok(4));
}

#[test]
fn blocked_transaction_times_out() {
    let stm = stm_with(StmBuilder::new().timeout(Duration::from_millis(25)));
    let never = TxnRef::new(false);

    let result = stm.atomic(|tx| never.await_value(tx, |v| *v));

    match result {
        Err(StmError::Timeout { waited, .. }) => {
            assert!(waited <= Duration::from_secs(5));
        }
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(never.surplus(), 0);
}

#[test]
fn stale_waiters_do_not_leak_wakeups() {
    let stm = stm_with(StmBuilder::new().timeout(Duration::from_millis(10)));
    let cell = TxnRef::new(0u32);

    // A waiter that timed out leaves its listener behind
    let result = stm.atomic(|tx| cell.await_value(tx, |v| *v > 0));
    assert!(matches!(result, Err(StmError::Timeout { .. })));

    // The stale listener is consumed by the next commit without effect
    cell.atomic_set(1).unwrap();
    assert_eq!(stm.atomic(|tx| cell.read(tx)).unwrap(), 1);
}
