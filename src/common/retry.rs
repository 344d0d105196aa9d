//! Bounded exponential retry for transient failures.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;

/// Errors that know whether trying again could help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for super::error::PaymentError {
    fn is_retryable(&self) -> bool {
        super::error::PaymentError::is_retryable(self)
    }
}

impl Retryable for crate::chain::ChainError {
    fn is_retryable(&self) -> bool {
        crate::chain::ChainError::is_retryable(self)
    }
}

impl Retryable for crate::storage::StorageError {
    fn is_retryable(&self) -> bool {
        self.kind() == super::error::ErrorKind::Transient
    }
}

impl Retryable for crate::bus::BusError {
    fn is_retryable(&self) -> bool {
        self.kind() == super::error::ErrorKind::Transient
    }
}

impl Retryable for crate::ledger::LedgerError {
    fn is_retryable(&self) -> bool {
        crate::ledger::LedgerError::is_retryable(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            multiplier: 1.0,
        }
    }

    /// Jittered delay schedule; elapsed time is unbounded, attempts are not
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            randomization_factor: 0.1,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the policy.
///
/// Only errors reporting `is_retryable()` are retried. The last error is
/// returned unchanged.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = AtomicU32::new(0);
    let max_attempts = policy.max_attempts.max(1);

    backoff::future::retry(policy.backoff(), || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::debug!(
                        target: "payments::retry",
                        operation,
                        attempt,
                        error = %e,
                        "transient failure, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ChainError> = retry_transient(&RetryPolicy::immediate(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainError::Timeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ChainError> = retry_transient(&RetryPolicy::immediate(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::Rejected("bad signature".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ChainError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ChainError> = retry_transient(&RetryPolicy::immediate(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::Timeout) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
