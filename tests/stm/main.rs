//! End-to-end STM tests through the public facade
//!
//! Each module drives a complete scenario with `Stm::atomic` or the
//! process-wide default runtime.

#[path = "../common/mod.rs"]
mod common;

mod atomic_ops;
mod blocking;
mod counters;
mod default_runtime;
mod isolation;
