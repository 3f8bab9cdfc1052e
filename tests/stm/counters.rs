//! Counter scenarios
//!
//! - No lost updates under heavy contention
//! - Commuting increments
//! - Random transfers conserve the total

use crate::common::*;
use rand::Rng;
use std::sync::Arc;
use strata_stm::{LockMode, TxnRef};

#[test]
fn hundred_threads_hundred_increments() {
    let stm = stm();
    let counter = TxnRef::new(0u64);

    let handles = {
        let stm = Arc::clone(&stm);
        let counter = counter.clone();
        spawn_synchronized(100, move |_| {
            for _ in 0..100 {
                stm.atomic(|tx| {
                    let value = counter.read(tx)?;
                    counter.write(tx, value + 1)
                })
                .unwrap();
            }
        })
    };
    join_all(handles);

    assert_eq!(counter.atomic_get().unwrap(), 10_000);
    assert_eq!(counter.version(), 10_000);
    assert_eq!(counter.lock_mode(), LockMode::None);
    assert_eq!(counter.surplus(), 0);

    let metrics = stm.metrics();
    assert_eq!(metrics.total_committed, 10_000);
    assert_eq!(metrics.active_count, 0);
}

#[test]
fn commuting_increments_all_apply() {
    let stm = stm();
    let counter = TxnRef::new(0u64);

    let handles = {
        let stm = Arc::clone(&stm);
        let counter = counter.clone();
        spawn_synchronized(20, move |_| {
            for _ in 0..50 {
                stm.atomic(|tx| counter.commute(tx, |v| v + 1)).unwrap();
            }
        })
    };
    join_all(handles);

    assert_eq!(counter.atomic_get().unwrap(), 1_000);
    assert_eq!(counter.version(), 1_000);

    let metrics = stm.metrics();
    assert_eq!(metrics.total_conflicts, 0);
    assert_eq!(metrics.total_committed, 1_000);
    assert_eq!(metrics.total_aborted, 0);
}

#[test]
fn random_transfers_conserve_total() {
    const ACCOUNTS: usize = 6;
    let stm = stm();
    let accounts: Arc<Vec<TxnRef<i64>>> =
        Arc::new((0..ACCOUNTS).map(|_| TxnRef::new(1_000)).collect());

    let handles = {
        let stm = Arc::clone(&stm);
        let accounts = Arc::clone(&accounts);
        spawn_synchronized(8, move |_| {
            let mut rng = rand::thread_rng();
            for _ in 0..250 {
                let from = rng.gen_range(0..ACCOUNTS);
                let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                let amount: i64 = rng.gen_range(1..=100);
                stm.atomic(|tx| {
                    accounts[from].alter(tx, |b| b - amount)?;
                    accounts[to].alter(tx, |b| b + amount)?;
                    Ok(())
                })
                .unwrap();
            }
        })
    };
    join_all(handles);

    let total: i64 = stm
        .atomic(|tx| {
            accounts
                .iter()
                .map(|a| a.read(tx))
                .sum::<Result<i64, _>>()
        })
        .unwrap();
    assert_eq!(total, 6_000);
}
