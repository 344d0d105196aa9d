//! Lock Manager
//!
//! TTL-bounded mutual exclusion per `(namespace, resource_key)`. A lock that
//! is never released expires on its own, which is the only recovery path
//! when a worker dies mid-operation.

pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::PaymentError;

pub use memory::MemoryLockManager;
pub use sqlite::SqliteLockManager;

pub const DEPOSIT_CONFIRM_NAMESPACE: &str = "deposit-confirm";
pub const WITHDRAW_NAMESPACE: &str = "withdraw";
pub const WITHDRAW_CONFIRM_NAMESPACE: &str = "withdraw-confirm";
pub const POOLING_NAMESPACE: &str = "pooling";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A held lock. Only the holder of `token` can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub namespace: String,
    pub resource_key: String,
    pub token: String,
    /// Unix milliseconds
    pub expires_at: i64,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take the lock, or `None` if someone else holds an unexpired one
    async fn acquire(
        &self,
        namespace: &str,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>, LockError>;

    /// Release if still owned by `lock.token`. Returns whether anything was removed.
    async fn release(&self, lock: &Lock) -> Result<bool, LockError>;
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run `f` while holding the lock. `Ok(None)` means the lock was busy and
/// `f` did not run.
pub async fn with_lock<T, F, Fut>(
    locks: &dyn LockManager,
    namespace: &str,
    resource_key: &str,
    ttl: Duration,
    f: F,
) -> Result<Option<T>, PaymentError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
{
    let lock = match locks.acquire(namespace, resource_key, ttl).await? {
        Some(lock) => lock,
        None => {
            tracing::debug!(
                target: "payments::lock",
                namespace,
                resource_key,
                "lock held elsewhere, skipping"
            );
            return Ok(None);
        }
    };

    let result = f().await;

    if let Err(e) = locks.release(&lock).await {
        // The TTL reclaims it
        tracing::warn!(
            target: "payments::lock",
            namespace,
            resource_key,
            error = %e,
            "failed to release lock"
        );
    }

    result.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let locks = MemoryLockManager::new();
        let out = with_lock(&locks, "ns", "k", Duration::from_secs(5), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, Some(7));

        // Released, so it can be taken again
        assert!(locks.acquire("ns", "k", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_busy() {
        let locks = MemoryLockManager::new();
        let _held = locks.acquire("ns", "k", Duration::from_secs(5)).await.unwrap().unwrap();

        let ran = AtomicU32::new(0);
        let out = with_lock(&locks, "ns", "k", Duration::from_secs(5), || async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(out.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_holders_are_exclusive() {
        let locks = Arc::new(MemoryLockManager::new());
        let inside = Arc::new(AtomicU32::new(0));
        let entered = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            handles.push(tokio::spawn(async move {
                with_lock(locks.as_ref(), "deposit-confirm", "eth:abc", Duration::from_secs(5), || async {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(entered.load(Ordering::SeqCst) >= 1);
    }
}
