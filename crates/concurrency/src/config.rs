//! Per-transaction configuration
//!
//! `TxnConfig` is built fluently and shared between the attempts of one
//! driver loop behind an `Arc`. `RetryConfig` holds the retry budget and
//! the exponential backoff applied between conflict retries.

use crate::lock::{DEFAULT_READ_BIASED_THRESHOLD, MAX_READONLY_STREAK};
use std::time::Duration;
use strata_core::{IsolationLevel, LockMode};

/// Configuration for transaction retry behavior
///
/// # Example
///
/// ```
/// use strata_concurrency::RetryConfig;
///
/// let config = RetryConfig::default()
///     .with_max_retries(5)
///     .with_base_delay_ms(1)
///     .with_max_delay_ms(50);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1000,
            base_delay_ms: 0,
            max_delay_ms: 10,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff)
    ///
    /// A zero delay means the driver only yields the thread.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Configuration applied to every attempt of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnConfig {
    /// Name reported in tracing fields
    pub family_name: String,
    /// Commit-time validation level
    pub isolation_level: IsolationLevel,
    /// Lock acquired on every read
    pub read_lock_mode: LockMode,
    /// Lock acquired on every write open
    pub write_lock_mode: LockMode,
    /// Whether `retry()` may park the thread
    pub blocking_allowed: bool,
    /// Deadline for blocking retries, measured from the first attempt
    pub timeout: Option<Duration>,
    /// Bounded spins on a locked cell before reporting a conflict
    pub spin_count: u32,
    /// Skip publishing writes whose value did not change
    pub dirty_check: bool,
    /// Reject writes, commutes and constructions
    pub readonly: bool,
    /// Revalidate reads whenever the global conflict counter moves
    pub speculative_consistency: bool,
    /// Read-only streak after which an idle cell becomes read-biased
    pub read_biased_threshold: u32,
    /// Retry budget and backoff
    pub retry: RetryConfig,
}

impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            family_name: "anonymous".to_string(),
            isolation_level: IsolationLevel::Snapshot,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            blocking_allowed: true,
            timeout: None,
            spin_count: 64,
            dirty_check: true,
            readonly: false,
            speculative_consistency: true,
            read_biased_threshold: DEFAULT_READ_BIASED_THRESHOLD,
            retry: RetryConfig::default(),
        }
    }
}

impl TxnConfig {
    /// Configuration with every default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the family name
    pub fn with_family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = name.into();
        self
    }

    /// Set the isolation level
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Set the lock taken on every read
    pub fn with_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    /// Set the lock taken on every write open
    pub fn with_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    /// Allow or forbid blocking retries
    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Set the blocking deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the spin budget on locked cells
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Enable or disable the dirty check
    pub fn with_dirty_check(mut self, enabled: bool) -> Self {
        self.dirty_check = enabled;
        self
    }

    /// Make the transaction read-only
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Enable or disable speculative revalidation
    pub fn with_speculative_consistency(mut self, enabled: bool) -> Self {
        self.speculative_consistency = enabled;
        self
    }

    /// Set the read-bias promotion threshold (clamped to the streak capacity)
    pub fn with_read_biased_threshold(mut self, threshold: u32) -> Self {
        self.read_biased_threshold = threshold.clamp(1, MAX_READONLY_STREAK);
        self
    }

    /// Set the retry budget and backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the retry budget only
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Lock actually taken when a cell is opened for writing
    ///
    /// A write open never takes a weaker lock than a read open would.
    pub fn effective_write_lock_mode(&self) -> LockMode {
        self.write_lock_mode.max(self.read_lock_mode)
    }
}
