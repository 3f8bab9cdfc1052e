//! Transaction manager
//!
//! Allocates transaction ids and starts transactions with a shared default
//! configuration. Commit itself is performed by the transaction; the manager
//! only wraps it so callers have a single place that guarantees a failed
//! commit leaves the transaction aborted.

use crate::config::TxnConfig;
use crate::conflict::global_conflict_counter;
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{StmResult, TxnId};

/// Starts transactions and hands out their ids
#[derive(Debug)]
pub struct TransactionManager {
    /// Next transaction ID
    next_txn_id: AtomicU64,

    /// Configuration used by `begin()`
    default_config: Arc<TxnConfig>,
}

impl TransactionManager {
    /// Create a manager whose transactions use `default_config`
    pub fn new(default_config: TxnConfig) -> Self {
        Self::with_txn_id(default_config, 0)
    }

    /// Create a manager whose first transaction id is `max_txn_id + 1`
    pub fn with_txn_id(default_config: TxnConfig, max_txn_id: u64) -> Self {
        TransactionManager {
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            default_config: Arc::new(default_config),
        }
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> TxnId {
        TxnId::new(self.next_txn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Configuration used by `begin()`
    pub fn default_config(&self) -> &Arc<TxnConfig> {
        &self.default_config
    }

    /// Current value of the process-wide conflict counter
    pub fn conflict_count(&self) -> u64 {
        global_conflict_counter().count()
    }

    /// Start a transaction with the default configuration
    pub fn begin(&self) -> Transaction {
        self.begin_with(Arc::clone(&self.default_config))
    }

    /// Start a transaction with `config`
    pub fn begin_with(&self, config: Arc<TxnConfig>) -> Transaction {
        Transaction::new(self.next_txn_id(), config)
    }

    /// Start attempt number `attempt` of a retry loop
    pub fn begin_attempt(&self, config: Arc<TxnConfig>, attempt: usize) -> Transaction {
        self.begin_with(config).with_attempt(attempt)
    }

    /// Commit a transaction
    pub fn commit(&self, txn: &mut Transaction) -> StmResult<()> {
        txn.commit()
    }

    /// Explicitly abort a transaction
    pub fn abort(&self, txn: &mut Transaction, reason: String) -> StmResult<()> {
        txn.abort_with_reason(reason)
    }

    /// Commit with automatic rollback on failure
    ///
    /// Ensures transaction is properly cleaned up if commit fails.
    pub fn commit_or_rollback(&self, txn: &mut Transaction) -> StmResult<()> {
        match self.commit(txn) {
            Ok(()) => Ok(()),
            Err(e) => {
                if txn.is_active() || txn.is_prepared() {
                    let _ = txn.abort_with_reason(format!("Commit failed: {}", e));
                }
                Err(e)
            }
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TxnConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::TxnRef;
    use crate::transaction::TransactionStatus;
    use strata_core::StmError;

    #[test]
    fn test_next_txn_id() {
        let manager = TransactionManager::default();
        assert_eq!(manager.next_txn_id(), TxnId::new(1));
        assert_eq!(manager.next_txn_id(), TxnId::new(2));
        assert_eq!(manager.next_txn_id(), TxnId::new(3));
    }

    #[test]
    fn test_with_txn_id() {
        let manager = TransactionManager::with_txn_id(TxnConfig::default(), 41);
        assert_eq!(manager.begin().id(), TxnId::new(42));
    }

    #[test]
    fn test_begin_uses_default_config() {
        let manager = TransactionManager::new(TxnConfig::new().with_family_name("transfers"));
        let txn = manager.begin();
        assert_eq!(txn.config().family_name, "transfers");
        assert!(txn.is_active());
    }

    #[test]
    fn test_begin_attempt_records_attempt() {
        let manager = TransactionManager::default();
        let txn = manager.begin_attempt(Arc::clone(manager.default_config()), 3);
        assert_eq!(txn.attempt(), 3);
    }

    #[test]
    fn test_commit_or_rollback_success() {
        let manager = TransactionManager::default();
        let cell = TxnRef::new(1u64);
        let mut txn = manager.begin();
        cell.write(&mut txn, 42).unwrap();

        let result = manager.commit_or_rollback(&mut txn);

        assert!(result.is_ok());
        assert_eq!(*txn.status(), TransactionStatus::Committed);
        assert_eq!(cell.atomic_get().unwrap(), 42);
    }

    #[test]
    fn test_commit_or_rollback_failure_cleans_up() {
        let manager = TransactionManager::default();
        let cell = TxnRef::new(100u64);

        let mut txn = manager.begin();
        let value = cell.read(&mut txn).unwrap();
        cell.write(&mut txn, value + 100).unwrap();

        // Concurrent modification causes conflict
        cell.atomic_set(300).unwrap();

        let result = manager.commit_or_rollback(&mut txn);

        assert!(matches!(result, Err(StmError::Conflict { .. })));
        assert!(matches!(txn.status(), TransactionStatus::Aborted { .. }));
        assert_eq!(cell.surplus(), 0);
    }

    #[test]
    fn test_abort_transaction() {
        let manager = TransactionManager::default();
        let mut txn = manager.begin();
        manager.abort(&mut txn, "user requested".to_string()).unwrap();
        assert_eq!(
            *txn.status(),
            TransactionStatus::Aborted {
                reason: "user requested".to_string()
            }
        );
    }
}
