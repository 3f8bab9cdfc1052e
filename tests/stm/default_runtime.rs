//! The process-wide default runtime
//!
//! Only this module touches the default in this test binary.

use std::time::Duration;
use strata_stm::{atomic, default_stm, reset_default, set_default, Stm, StmError, TxnRef};

#[test]
fn default_runtime_can_be_replaced_and_reset() {
    let cell = TxnRef::new(1u32);
    assert_eq!(atomic(|tx| cell.alter(tx, |v| v + 1)).unwrap(), 2);

    set_default(
        Stm::builder()
            .timeout(Duration::from_millis(10))
            .build()
            .unwrap(),
    );
    let result = atomic(|tx| cell.await_value(tx, |v| *v > 10));
    assert!(matches!(result, Err(StmError::Timeout { .. })));
    assert_eq!(default_stm().metrics().total_retries, 1);

    reset_default();
    assert_eq!(default_stm().txn_config().timeout, None);
    assert_eq!(default_stm().metrics().total_started, 0);
}
