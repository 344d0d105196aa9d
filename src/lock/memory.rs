//! Process-local lock manager for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{new_token, now_millis, Lock, LockError, LockManager};

#[derive(Clone, Default)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashMap<(String, String), Lock>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        namespace: &str,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>, LockError> {
        let now = now_millis();
        let mut held = self.held.lock().await;
        let key = (namespace.to_string(), resource_key.to_string());

        if let Some(existing) = held.get(&key) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let lock = Lock {
            namespace: namespace.to_string(),
            resource_key: resource_key.to_string(),
            token: new_token(),
            expires_at: now + ttl.as_millis() as i64,
        };
        held.insert(key, lock.clone());
        Ok(Some(lock))
    }

    async fn release(&self, lock: &Lock) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let key = (lock.namespace.clone(), lock.resource_key.clone());

        match held.get(&key) {
            Some(current) if current.token == lock.token => {
                held.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let locks = MemoryLockManager::new();
        let first = locks.acquire("withdraw", "u1", Duration::from_secs(5)).await.unwrap();
        assert!(first.is_some());
        assert!(locks.acquire("withdraw", "u1", Duration::from_secs(5)).await.unwrap().is_none());
        // Different key, different namespace
        assert!(locks.acquire("withdraw", "u2", Duration::from_secs(5)).await.unwrap().is_some());
        assert!(locks.acquire("pooling", "u1", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_and_stale_release_is_ignored() {
        let locks = MemoryLockManager::new();
        let stale = locks
            .acquire("withdraw", "u1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = locks
            .acquire("withdraw", "u1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);

        // The crashed holder's release must not free the new owner's lock
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.acquire("withdraw", "u1", Duration::from_secs(5)).await.unwrap().is_none());
        assert!(locks.release(&fresh).await.unwrap());
    }
}
