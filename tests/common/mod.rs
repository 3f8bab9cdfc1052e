//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use std::sync::{Arc, Barrier, Once};
use std::thread::{self, JoinHandle};

use strata_stm::{Stm, StmBuilder};

static INIT_TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
            .try_init();
    });
}

/// Fresh runtime with default settings
pub fn stm() -> Arc<Stm> {
    init_tracing();
    Arc::new(Stm::new())
}

/// Fresh runtime from a configured builder
pub fn stm_with(builder: StmBuilder) -> Arc<Stm> {
    init_tracing();
    Arc::new(builder.build().expect("valid test config"))
}

/// Spawn `threads` workers that start together; worker `i` runs `f(i)`
pub fn spawn_synchronized<T, F>(threads: usize, f: F) -> Vec<JoinHandle<T>>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(threads));
    let f = Arc::new(f);
    (0..threads)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let f = Arc::clone(&f);
            thread::spawn(move || {
                barrier.wait();
                f(i)
            })
        })
        .collect()
}

/// Join all handles, propagating panics
pub fn join_all<T>(handles: Vec<JoinHandle<T>>) -> Vec<T> {
    handles
        .into_iter()
        .map(|h| h.join().expect("worker thread panicked"))
        .collect()
}
