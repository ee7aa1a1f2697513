//! Running bank calls from async code

use fints_core::{BankError, BankResult};
use tracing::error;

/// Run a blocking bank call on the blocking thread pool
///
/// The protocol library does network I/O synchronously; calling it directly
/// from a Tokio worker would stall every other task on that worker.
pub async fn run_blocking<R, F>(f: F) -> BankResult<R>
where
    F: FnOnce() -> BankResult<R> + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => {
            error!("Bank call panicked or was cancelled: {}", err);
            Err(BankError::Connection(format!("bank call did not complete: {}", err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_closure_result() {
        let value = run_blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_panic_becomes_connection_error() {
        let result: BankResult<()> = run_blocking(|| panic!("boom")).await;
        assert!(matches!(result, Err(BankError::Connection(_))));
    }
}
