//! The STM runtime
//!
//! `Stm` owns a transaction coordinator and the default per-transaction
//! configuration, and drives closures to completion with [`Stm::atomic`]:
//!
//! - conflicts abort the attempt and re-run the closure after a backoff
//! - `retry()` parks the thread until a cell the attempt read changes
//! - any other error aborts and is returned unchanged
//!
//! ```text
//! let stm = Stm::new();
//! let account = TxnRef::new(100i64);
//! stm.atomic(|tx| account.alter(tx, |balance| balance - 10))?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strata_concurrency::{Latch, Transaction, TxnConfig};
use strata_core::{AsStmError, StmError, StmResult};
use tracing::{debug, info, warn};

use crate::builder::StmBuilder;
use crate::config::{ConfigError, StmConfig};
use crate::coordinator::{TransactionCoordinator, TransactionMetrics};

/// A software transactional memory runtime
#[derive(Debug)]
pub struct Stm {
    coordinator: TransactionCoordinator,
    txn_config: Arc<TxnConfig>,
}

impl Stm {
    /// Runtime with every default
    pub fn new() -> Self {
        Self::with_txn_config(TxnConfig::default())
    }

    /// Fluent configuration
    pub fn builder() -> StmBuilder {
        StmBuilder::new()
    }

    /// Runtime from a validated config
    pub fn from_config(config: &StmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_txn_config(config.txn_config()))
    }

    /// Runtime from a config file, creating the default file first if absent
    pub fn from_config_file(path: &Path) -> Result<Self, ConfigError> {
        StmConfig::write_default_if_missing(path)?;
        let config = StmConfig::from_file(path)?;
        Self::from_config(&config)
    }

    pub(crate) fn with_txn_config(txn_config: TxnConfig) -> Self {
        info!(
            target: "strata::stm",
            isolation = ?txn_config.isolation_level,
            max_retries = txn_config.retry.max_retries,
            spin_count = txn_config.spin_count,
            timeout = ?txn_config.timeout,
            "STM runtime created"
        );
        let coordinator = TransactionCoordinator::new(txn_config);
        let txn_config = Arc::clone(coordinator.manager().default_config());
        Stm {
            coordinator,
            txn_config,
        }
    }

    /// Configuration used by `atomic` and `begin_transaction`
    pub fn txn_config(&self) -> &Arc<TxnConfig> {
        &self.txn_config
    }

    /// Snapshot of transaction statistics
    pub fn metrics(&self) -> TransactionMetrics {
        self.coordinator.metrics()
    }

    /// Current value of the process-wide conflict counter
    pub fn conflict_count(&self) -> u64 {
        self.coordinator.manager().conflict_count()
    }

    /// Begin a transaction for manual control
    ///
    /// Prefer [`atomic`](Self::atomic), which retries and blocks. A manual
    /// transaction must be finished with [`commit`](Self::commit) or
    /// [`abort`](Self::abort); dropping it aborts.
    pub fn begin_transaction(&self) -> Transaction {
        self.coordinator
            .start_transaction(Arc::clone(&self.txn_config), 0)
    }

    /// Begin a transaction with a specific configuration
    pub fn begin_transaction_with(&self, config: impl Into<Arc<TxnConfig>>) -> Transaction {
        self.coordinator.start_transaction(config.into(), 0)
    }

    /// Commit a manual transaction
    pub fn commit(&self, txn: &mut Transaction) -> StmResult<()> {
        self.coordinator.commit(txn)
    }

    /// Abort a manual transaction
    pub fn abort(&self, txn: &mut Transaction, reason: &str) {
        self.coordinator.rollback(txn, reason);
    }

    /// Run `body` as a transaction until it commits
    ///
    /// # Errors
    ///
    /// - `TooManyRetries` when the attempt budget is spent
    /// - `Timeout`, `NoRetryPossible` or `RetryNotAllowed` from a blocked retry
    /// - any other error returned by `body`, after the attempt is aborted
    pub fn atomic<T, F>(&self, body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        self.drive(Arc::clone(&self.txn_config), body)
    }

    /// Like [`atomic`](Self::atomic) with a specific configuration
    pub fn atomic_with<T, F>(&self, config: impl Into<Arc<TxnConfig>>, body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        self.drive(config.into(), body)
    }

    /// Like [`atomic`](Self::atomic) for closures with their own error type
    ///
    /// Conflicts and retries embedded in `E` are still handled by the driver;
    /// every other error aborts the attempt and is returned as is.
    pub fn atomic_or_err<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<StmError> + AsStmError,
        F: FnMut(&mut Transaction) -> Result<T, E>,
    {
        self.drive(Arc::clone(&self.txn_config), body)
    }

    fn drive<T, E, F>(&self, config: Arc<TxnConfig>, mut body: F) -> Result<T, E>
    where
        E: From<StmError> + AsStmError,
        F: FnMut(&mut Transaction) -> Result<T, E>,
    {
        let latch = Arc::new(Latch::new());
        let deadline = config.timeout.map(|timeout| Instant::now() + timeout);
        let max_retries = config.retry.max_retries;
        let mut attempt = 0usize;

        loop {
            let mut txn = self
                .coordinator
                .start_transaction(Arc::clone(&config), attempt);
            let mut outcome = AttemptGuard::new(&self.coordinator);

            let failure = match body(&mut txn) {
                Ok(value) => {
                    let committed = self.coordinator.commit(&mut txn);
                    outcome.settle();
                    match committed {
                        Ok(()) => return Ok(value),
                        Err(e) if e.is_conflict() => e,
                        Err(e) => return Err(E::from(e)),
                    }
                }
                Err(e) => match e.as_stm_error() {
                    Some(inner) if inner.is_conflict() => {
                        let inner = inner.clone();
                        self.coordinator.record_conflict();
                        self.coordinator.rollback(&mut txn, "conflict");
                        outcome.settle();
                        inner
                    }
                    Some(StmError::Retry) => StmError::Retry,
                    _ => {
                        self.coordinator.rollback(&mut txn, "transaction body failed");
                        outcome.settle();
                        return Err(e);
                    }
                },
            };

            if attempt >= max_retries {
                if failure.is_retry() {
                    self.coordinator.rollback(&mut txn, "retry budget exhausted");
                    outcome.settle();
                }
                warn!(
                    target: "strata::stm",
                    family = %config.family_name,
                    attempts = attempt + 1,
                    last = %failure,
                    "Transaction gave up"
                );
                return Err(E::from(StmError::TooManyRetries {
                    attempts: attempt + 1,
                    last: Box::new(failure),
                }));
            }

            if failure.is_retry() {
                self.coordinator.record_retry();
                let woken = txn.block_until_changed(&latch, deadline);
                self.coordinator.record_abort();
                outcome.settle();
                woken.map_err(E::from)?;
            } else {
                let delay = config.retry.calculate_delay(attempt);
                debug!(
                    target: "strata::stm",
                    family = %config.family_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Retrying after conflict"
                );
                backoff(delay);
            }
            attempt += 1;
        }
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

/// Records an abort for an attempt that unwinds before its outcome is
/// accounted for, e.g. when the body panics
struct AttemptGuard<'a> {
    coordinator: &'a TransactionCoordinator,
    settled: bool,
}

impl<'a> AttemptGuard<'a> {
    fn new(coordinator: &'a TransactionCoordinator) -> Self {
        AttemptGuard {
            coordinator,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.record_abort();
        }
    }
}

fn backoff(delay: Duration) {
    if delay.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_concurrency::{guard, TxnRef};
    use strata_core::IsolationLevel;
    use thiserror::Error;

    // ========================================================================
    // atomic
    // ========================================================================

    #[test]
    fn test_atomic_commits_body() {
        let stm = Stm::new();
        let cell = TxnRef::new(10i64);

        let result = stm.atomic(|tx| cell.alter(tx, |v| v * 2)).unwrap();

        assert_eq!(result, 20);
        assert_eq!(cell.atomic_get().unwrap(), 20);
        let metrics = stm.metrics();
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.active_count, 0);
    }

    #[test]
    fn test_atomic_reruns_after_conflict() {
        let stm = Stm::new();
        let cell = TxnRef::new(0u32);
        let runs = AtomicUsize::new(0);

        let result = stm
            .atomic(|tx| {
                let value = cell.read(tx)?;
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Another writer commits underneath the first attempt
                    cell.atomic_set(100)?;
                }
                cell.write(tx, value + 1)?;
                Ok(value)
            })
            .unwrap();

        assert_eq!(result, 100);
        assert_eq!(cell.atomic_get().unwrap(), 101);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let metrics = stm.metrics();
        assert_eq!(metrics.total_conflicts, 1);
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.total_aborted, 1);
    }

    #[test]
    fn test_atomic_gives_up_after_budget() {
        let stm = Stm::builder().max_retries(3).build().unwrap();
        let cell = TxnRef::new(0u32);
        let runs = AtomicUsize::new(0);

        let result = stm.atomic(|tx| {
            runs.fetch_add(1, Ordering::SeqCst);
            let value = cell.read(tx)?;
            cell.atomic_set(value + 1)?;
            cell.write(tx, value)
        });

        match result {
            Err(StmError::TooManyRetries { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(last.is_conflict());
            }
            other => panic!("expected TooManyRetries, got {:?}", other),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_atomic_returns_body_error_and_rolls_back() {
        let stm = Stm::new();
        let cell = TxnRef::new(1u8);

        let result: StmResult<()> = stm.atomic(|tx| {
            cell.write(tx, 2)?;
            Err(StmError::aborted("insufficient funds"))
        });

        assert!(matches!(result, Err(StmError::Aborted { .. })));
        assert_eq!(cell.atomic_get().unwrap(), 1);
        assert_eq!(stm.metrics().total_aborted, 1);
    }

    #[test]
    fn test_panicking_body_is_counted_as_abort() {
        let stm = Stm::new();
        let cell = TxnRef::new(1u32);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stm.atomic(|tx| -> StmResult<()> {
                cell.write(tx, 2)?;
                panic!("body failed")
            })
        }));
        assert!(outcome.is_err());

        let metrics = stm.metrics();
        assert_eq!(metrics.active_count, 0);
        assert_eq!(metrics.total_started, 1);
        assert_eq!(metrics.total_aborted, 1);
        assert_eq!(cell.atomic_get().unwrap(), 1);
        assert_eq!(cell.lock_mode(), strata_core::LockMode::None);

        stm.atomic(|tx| cell.write(tx, 3)).unwrap();
        assert_eq!(stm.metrics().active_count, 0);
        assert_eq!(stm.metrics().total_committed, 1);
    }

    #[test]
    fn test_atomic_with_serializable_config() {
        let stm = Stm::new();
        let config = TxnConfig::new().with_isolation_level(IsolationLevel::Serializable);
        let cell = TxnRef::new(5u32);

        let value = stm.atomic_with(config, |tx| {
            assert_eq!(tx.config().isolation_level, IsolationLevel::Serializable);
            cell.read(tx)
        });

        assert_eq!(value, Ok(5));
    }

    // ========================================================================
    // Blocking retry
    // ========================================================================

    #[test]
    fn test_retry_without_reads_is_not_possible() {
        let stm = Stm::new();
        let result: StmResult<()> = stm.atomic(|tx| tx.retry());
        assert!(matches!(result, Err(StmError::NoRetryPossible { .. })));
    }

    #[test]
    fn test_retry_with_blocking_disabled() {
        let stm = Stm::builder().blocking_allowed(false).build().unwrap();
        let flag = TxnRef::new(false);
        let result = stm.atomic(|tx| {
            let ready = flag.read(tx)?;
            guard(ready)
        });
        assert!(matches!(result, Err(StmError::RetryNotAllowed { .. })));
    }

    #[test]
    fn test_retry_times_out() {
        let stm = Stm::builder()
            .timeout(Duration::from_millis(30))
            .build()
            .unwrap();
        let flag = TxnRef::new(false);

        let started = Instant::now();
        let result = stm.atomic(|tx| flag.await_value(tx, |ready| *ready));

        assert!(matches!(result, Err(StmError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(stm.metrics().total_retries, 1);
        assert_eq!(stm.metrics().active_count, 0);
    }

    #[test]
    fn test_retry_wakes_on_write() {
        let stm = Arc::new(Stm::new());
        let flag = TxnRef::new(false);

        let waiter = {
            let stm = Arc::clone(&stm);
            let flag = flag.clone();
            thread::spawn(move || stm.atomic(|tx| flag.await_value(tx, |ready| *ready)))
        };

        thread::sleep(Duration::from_millis(20));
        stm.atomic(|tx| flag.write(tx, true)).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(true));
    }

    // ========================================================================
    // atomic_or_err
    // ========================================================================

    #[derive(Debug, Error)]
    enum BankError {
        #[error("insufficient funds: {available}")]
        InsufficientFunds { available: i64 },
        #[error(transparent)]
        Stm(#[from] StmError),
    }

    impl AsStmError for BankError {
        fn as_stm_error(&self) -> Option<&StmError> {
            match self {
                BankError::Stm(e) => Some(e),
                BankError::InsufficientFunds { .. } => None,
            }
        }
    }

    #[test]
    fn test_atomic_or_err_passes_application_error_through() {
        let stm = Stm::new();
        let balance = TxnRef::new(30i64);

        let result = stm.atomic_or_err(|tx| {
            let available = balance.read(tx)?;
            if available < 50 {
                return Err(BankError::InsufficientFunds { available });
            }
            balance.write(tx, available - 50)?;
            Ok(())
        });

        assert!(matches!(
            result,
            Err(BankError::InsufficientFunds { available: 30 })
        ));
        assert_eq!(balance.atomic_get().unwrap(), 30);
    }

    #[test]
    fn test_atomic_or_err_still_retries_conflicts() {
        let stm = Stm::new();
        let balance = TxnRef::new(100i64);
        let runs = AtomicUsize::new(0);

        let result: Result<i64, BankError> = stm.atomic_or_err(|tx| {
            let available = balance.read(tx)?;
            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                balance.atomic_set(80)?;
            }
            balance.write(tx, available - 50)?;
            Ok(available - 50)
        });

        assert_eq!(result.unwrap(), 30);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    // ========================================================================
    // Manual transactions
    // ========================================================================

    #[test]
    fn test_manual_transaction_commit_and_abort() {
        let stm = Stm::new();
        let cell = TxnRef::new(0u16);

        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, 7).unwrap();
        stm.commit(&mut txn).unwrap();
        assert_eq!(cell.atomic_get().unwrap(), 7);

        let mut txn = stm.begin_transaction();
        cell.write(&mut txn, 9).unwrap();
        stm.abort(&mut txn, "changed my mind");
        assert!(txn.is_aborted());
        assert_eq!(cell.atomic_get().unwrap(), 7);

        let metrics = stm.metrics();
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.total_aborted, 1);
    }

    #[test]
    fn test_from_config_applies_settings() {
        let config = StmConfig {
            isolation: IsolationLevel::Serializable,
            max_retries: 5,
            ..StmConfig::default()
        };
        let stm = Stm::from_config(&config).unwrap();
        assert_eq!(
            stm.txn_config().isolation_level,
            IsolationLevel::Serializable
        );
        assert_eq!(stm.txn_config().retry.max_retries, 5);
        assert_eq!(stm.begin_transaction().config().retry.max_retries, 5);
    }
}
