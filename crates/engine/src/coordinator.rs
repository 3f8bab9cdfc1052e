//! Transaction coordinator for managing transaction lifecycle
//!
//! The TransactionCoordinator wraps TransactionManager and adds:
//! - Active transaction tracking
//! - Transaction metrics (started, committed, aborted, conflicts, retries)
//! - Commit rate calculation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_concurrency::{Transaction, TransactionManager, TxnConfig};
use strata_core::StmResult;
use tracing::{debug, warn};

/// Transaction coordinator for an STM runtime
///
/// # Memory Ordering
///
/// The metric counters use Relaxed ordering: they are purely observational
/// and do not synchronize any other memory operations.
#[derive(Debug)]
pub struct TransactionCoordinator {
    /// Transaction manager for ID allocation
    manager: TransactionManager,
    /// Active transaction count
    active_count: AtomicU64,
    /// Total transactions started
    total_started: AtomicU64,
    /// Total transactions committed
    total_committed: AtomicU64,
    /// Total transactions aborted
    total_aborted: AtomicU64,
    /// Attempts that ended in a conflict
    total_conflicts: AtomicU64,
    /// Attempts that blocked on `retry()`
    total_retries: AtomicU64,
}

impl TransactionCoordinator {
    /// Create a coordinator whose transactions default to `config`
    pub fn new(config: TxnConfig) -> Self {
        Self {
            manager: TransactionManager::new(config),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_conflicts: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    /// Underlying manager
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Start attempt `attempt` of a transaction using `config`
    ///
    /// Increments active count and total started metrics.
    pub fn start_transaction(&self, config: Arc<TxnConfig>, attempt: usize) -> Transaction {
        let txn = self.manager.begin_attempt(config, attempt);
        self.record_start();
        debug!(
            target: "strata::stm",
            txn_id = %txn.id(),
            family = %txn.config().family_name,
            attempt,
            "Transaction started"
        );
        txn
    }

    /// Commit through the concurrency layer, recording the outcome
    pub fn commit(&self, txn: &mut Transaction) -> StmResult<()> {
        match self.manager.commit_or_rollback(txn) {
            Ok(()) => {
                self.record_commit();
                Ok(())
            }
            Err(e) => {
                if e.is_conflict() {
                    self.record_conflict();
                }
                self.record_abort();
                debug!(target: "strata::stm", txn_id = %txn.id(), error = %e, "Commit failed");
                Err(e)
            }
        }
    }

    /// Abort `txn` if it is still running and record the abort
    pub fn rollback(&self, txn: &mut Transaction, reason: &str) {
        if txn.is_active() || txn.is_prepared() {
            if let Err(e) = self.manager.abort(txn, reason.to_string()) {
                warn!(target: "strata::stm", txn_id = %txn.id(), error = %e, "Rollback failed");
            }
        }
        self.record_abort();
    }

    /// Record transaction start
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction commit
    ///
    /// Decrements active count (saturating at 0) and increments committed count.
    pub fn record_commit(&self) {
        self.leave_active();
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction abort
    ///
    /// Decrements active count and increments aborted count.
    pub fn record_abort(&self) {
        self.leave_active();
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt that failed with a conflict
    pub fn record_conflict(&self) {
        self.total_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt that blocked on `retry()`
    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn leave_active(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    /// Get transaction metrics
    ///
    /// Returns current snapshot of transaction statistics.
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            total_conflicts: self.total_conflicts.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }

    /// Get current active transaction count
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Transaction metrics
///
/// Provides statistics about transaction lifecycle.
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    /// Number of currently active transactions
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of transactions aborted
    pub total_aborted: u64,
    /// Attempts that ended in a conflict
    pub total_conflicts: u64,
    /// Attempts that blocked on `retry()`
    pub total_retries: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
