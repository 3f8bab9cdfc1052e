//! Transaction-free atomic operations mixed with transactions

use crate::common::*;
use std::sync::Arc;
use strata_stm::{StmError, TxnRef};

#[test]
fn compare_and_set_counter_across_threads() {
    let counter = TxnRef::new(0u64);

    let handles = {
        let counter = counter.clone();
        spawn_synchronized(8, move |_| {
            let mut successes = 0u64;
            while successes < 100 {
                let current = counter.atomic_weak_get();
                match counter.atomic_compare_and_set(&current, current + 1) {
                    Ok(true) => successes += 1,
                    Ok(false) | Err(StmError::Locked { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        })
    };
    join_all(handles);

    assert_eq!(counter.atomic_get().unwrap(), 800);
    assert_eq!(counter.version(), 800);
}

#[test]
fn atomic_write_invalidates_running_transaction() {
    let stm = stm();
    let cell = TxnRef::new(String::from("before"));

    let mut txn = stm.begin_transaction();
    assert_eq!(cell.read(&mut txn).unwrap(), "before");
    assert_eq!(
        cell.atomic_get_and_set(String::from("after")).unwrap(),
        "before"
    );
    cell.write(&mut txn, String::from("mine")).unwrap();

    assert!(matches!(
        stm.commit(&mut txn),
        Err(StmError::Conflict { .. })
    ));
    assert_eq!(cell.atomic_get().unwrap(), "after");
}

#[test]
fn atomic_alter_and_transactions_interleave() {
    let stm = stm();
    let cell = TxnRef::new(0i32);

    let handles = {
        let stm = Arc::clone(&stm);
        let cell = cell.clone();
        spawn_synchronized(4, move |i| {
            for _ in 0..100 {
                if i % 2 == 0 {
                    loop {
                        match cell.atomic_alter(|v| v + 1) {
                            Ok(_) => break,
                            Err(StmError::Locked { .. }) => std::thread::yield_now(),
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                } else {
                    stm.atomic(|tx| cell.alter(tx, |v| v + 1)).unwrap();
                }
            }
        })
    };
    join_all(handles);

    assert_eq!(cell.atomic_get().unwrap(), 400);
}
