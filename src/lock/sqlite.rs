//! SQLite lock table. Every process pointed at the same database file
//! shares the same locks.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::params;

use super::{new_token, now_millis, Lock, LockError, LockManager};
use crate::storage::SqlitePool;

pub struct SqliteLockManager {
    pool: SqlitePool,
}

impl SqliteLockManager {
    pub fn new(pool: SqlitePool) -> Result<Self, LockError> {
        let manager = Self { pool };
        manager.run_migrations()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>, LockError> {
        self.pool.get().map_err(|e| LockError::Backend(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), LockError> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS locks (
                    namespace TEXT NOT NULL,
                    resource_key TEXT NOT NULL,
                    token TEXT NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (namespace, resource_key)
                );
                "#,
            )
            .map_err(|e| LockError::Backend(e.to_string()))
    }

    fn acquire_sync(&self, namespace: &str, resource_key: &str, ttl: Duration) -> Result<Option<Lock>, LockError> {
        let now = now_millis();
        let lock = Lock {
            namespace: namespace.to_string(),
            resource_key: resource_key.to_string(),
            token: new_token(),
            expires_at: now + ttl.as_millis() as i64,
        };

        // Takes over the row only when the current holder has expired
        let changed = self
            .conn()?
            .execute(
                r#"
                INSERT INTO locks (namespace, resource_key, token, expires_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (namespace, resource_key) DO UPDATE
                    SET token = excluded.token, expires_at = excluded.expires_at
                    WHERE locks.expires_at <= ?5
                "#,
                params![lock.namespace, lock.resource_key, lock.token, lock.expires_at, now],
            )
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok((changed == 1).then_some(lock))
    }

    fn release_sync(&self, lock: &Lock) -> Result<bool, LockError> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM locks WHERE namespace = ?1 AND resource_key = ?2 AND token = ?3",
                params![lock.namespace, lock.resource_key, lock.token],
            )
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(removed > 0)
    }
}

#[async_trait]
impl LockManager for SqliteLockManager {
    async fn acquire(
        &self,
        namespace: &str,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>, LockError> {
        self.acquire_sync(namespace, resource_key, ttl)
    }

    async fn release(&self, lock: &Lock) -> Result<bool, LockError> {
        self.release_sync(lock)
    }
}
