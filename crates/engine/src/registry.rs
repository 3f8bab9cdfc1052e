//! Process-wide default runtime
//!
//! Code that cannot thread an `Stm` through its call sites uses the lazily
//! created default. Tests replace it with `set_default` and restore a fresh
//! one with `reset_default`.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;

use strata_concurrency::Transaction;
use strata_core::StmResult;

use crate::stm::Stm;

/// Global default runtime
static DEFAULT_STM: Lazy<RwLock<Arc<Stm>>> = Lazy::new(|| RwLock::new(Arc::new(Stm::new())));

/// The current default runtime
pub fn default_stm() -> Arc<Stm> {
    Arc::clone(&DEFAULT_STM.read())
}

/// Replace the default runtime, returning the previous one
///
/// Transactions already running on the previous runtime are unaffected.
pub fn set_default(stm: Stm) -> Arc<Stm> {
    std::mem::replace(&mut *DEFAULT_STM.write(), Arc::new(stm))
}

/// Replace the default runtime with a freshly configured one
pub fn reset_default() -> Arc<Stm> {
    set_default(Stm::new())
}

/// Run `body` on the default runtime, see [`Stm::atomic`]
pub fn atomic<T, F>(body: F) -> StmResult<T>
where
    F: FnMut(&mut Transaction) -> StmResult<T>,
{
    default_stm().atomic(body)
}
