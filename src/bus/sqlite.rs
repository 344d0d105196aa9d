//! SQLite-backed durable bus.
//!
//! Messages survive restarts; an unsettled lease expires after the
//! visibility timeout so a crashed consumer's message is redelivered. Acked
//! rows are kept (status `acked`) so their dedup keys stay effective until
//! the retention sweep removes them.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use super::{
    redelivery_after, BusError, BusSettings, DeadLetter, Delivery, Envelope, EventBus, NackOutcome,
};
use crate::storage::SqlitePool;

pub struct SqliteBus {
    pool: SqlitePool,
    settings: BusSettings,
}

fn backend(e: impl std::fmt::Display) -> BusError {
    BusError::Backend(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteBus {
    pub fn new(pool: SqlitePool, settings: BusSettings) -> Result<Self, BusError> {
        let bus = Self { pool, settings };
        bus.run_migrations()?;
        Ok(bus)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>, BusError> {
        self.pool.get().map_err(backend)
    }

    fn run_migrations(&self) -> Result<(), BusError> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS bus_bindings (
                    queue TEXT NOT NULL,
                    routing_key TEXT NOT NULL,
                    PRIMARY KEY (queue, routing_key)
                );

                CREATE TABLE IF NOT EXISTS bus_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    dedup_key TEXT,
                    envelope TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'ready',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    available_at INTEGER NOT NULL,
                    leased_until INTEGER,
                    last_error TEXT,
                    created_at INTEGER NOT NULL,
                    UNIQUE (queue, dedup_key)
                );

                CREATE INDEX IF NOT EXISTS idx_bus_messages_ready
                    ON bus_messages(queue, status, available_at);

                CREATE TABLE IF NOT EXISTS bus_dead_letters (
                    message_id INTEGER PRIMARY KEY,
                    queue TEXT NOT NULL,
                    envelope TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    error TEXT NOT NULL,
                    dead_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(backend)
    }

    fn declare_sync(&self, queue: &str, routing_keys: &[String]) -> Result<(), BusError> {
        let conn = self.conn()?;
        for key in routing_keys {
            conn.execute(
                "INSERT OR IGNORE INTO bus_bindings (queue, routing_key) VALUES (?1, ?2)",
                params![queue, key],
            )
            .map_err(backend)?;
        }
        Ok(())
    }

    fn publish_sync(&self, envelope: &Envelope) -> Result<usize, BusError> {
        let raw = serde_json::to_string(envelope).map_err(|e| BusError::Encode(e.to_string()))?;
        let now = now_millis();

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;

        let queues: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT queue FROM bus_bindings WHERE routing_key = ?1")
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![envelope.routing_key], |row| row.get(0))
                .map_err(backend)?;
            rows.collect::<Result<_, _>>().map_err(backend)?
        };

        let mut routed = 0;
        for queue in &queues {
            routed += tx
                .execute(
                    r#"
                    INSERT OR IGNORE INTO bus_messages (queue, dedup_key, envelope, available_at, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?4)
                    "#,
                    params![queue, envelope.headers.dedup_key, raw, now],
                )
                .map_err(backend)?;
        }

        tx.commit().map_err(backend)?;
        Ok(routed)
    }

    fn receive_sync(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        let now = now_millis();
        let lease = now + self.settings.visibility_timeout.as_millis() as i64;

        let row: Option<(i64, String, i64)> = self
            .conn()?
            .query_row(
                r#"
                UPDATE bus_messages
                SET attempts = attempts + 1, leased_until = ?3
                WHERE id = (
                    SELECT id FROM bus_messages
                    WHERE queue = ?1 AND status = 'ready' AND available_at <= ?2
                      AND (leased_until IS NULL OR leased_until <= ?2)
                    ORDER BY id
                    LIMIT 1
                )
                RETURNING id, envelope, attempts
                "#,
                params![queue, now, lease],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(backend)?;

        let Some((id, raw, attempts)) = row else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw).map_err(|e| BusError::Decode(e.to_string()))?;

        Ok(Some(Delivery {
            delivery_id: id,
            queue: queue.to_string(),
            envelope,
            attempt: attempts as u32,
        }))
    }

    fn ack_sync(&self, delivery: &Delivery) -> Result<(), BusError> {
        self.conn()?
            .execute(
                "UPDATE bus_messages SET status = 'acked', leased_until = NULL WHERE id = ?1",
                params![delivery.delivery_id],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn nack_sync(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, BusError> {
        let now = now_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(backend)?;

        let row: Option<(u32, String)> = tx
            .query_row(
                "SELECT attempts, envelope FROM bus_messages WHERE id = ?1 AND status = 'ready'",
                params![delivery.delivery_id],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;

        let Some((attempts, raw)) = row else {
            return Ok(NackOutcome::Requeued);
        };

        let outcome = if attempts >= self.settings.max_attempts {
            tx.execute(
                "UPDATE bus_messages SET status = 'dead', leased_until = NULL, last_error = ?2 WHERE id = ?1",
                params![delivery.delivery_id, error],
            )
            .map_err(backend)?;
            tx.execute(
                r#"
                INSERT OR REPLACE INTO bus_dead_letters (message_id, queue, envelope, attempts, error, dead_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![delivery.delivery_id, delivery.queue, raw, attempts as i64, error, now],
            )
            .map_err(backend)?;
            NackOutcome::DeadLettered
        } else {
            let available_at = now + redelivery_after(&self.settings, attempts).as_millis() as i64;
            tx.execute(
                r#"
                UPDATE bus_messages
                SET leased_until = NULL, available_at = ?2, last_error = ?3
                WHERE id = ?1
                "#,
                params![delivery.delivery_id, available_at, error],
            )
            .map_err(backend)?;
            NackOutcome::Requeued
        };

        tx.commit().map_err(backend)?;
        Ok(outcome)
    }

    fn purge_settled_sync(&self, older_than: Duration) -> Result<usize, BusError> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        // Dead rows keep their copy in bus_dead_letters
        self.conn()?
            .execute(
                "DELETE FROM bus_messages WHERE status IN ('acked', 'dead') AND created_at < ?1",
                params![cutoff],
            )
            .map_err(backend)
    }

    fn dead_letters_sync(&self, queue: &str) -> Result<Vec<DeadLetter>, BusError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT envelope, attempts, error FROM bus_dead_letters WHERE queue = ?1 ORDER BY dead_at",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map(params![queue], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(backend)?;

        let mut dead = Vec::new();
        for row in rows {
            let (raw, attempts, error) = row.map_err(backend)?;
            dead.push(DeadLetter {
                queue: queue.to_string(),
                envelope: serde_json::from_str(&raw).map_err(|e| BusError::Decode(e.to_string()))?,
                attempts: attempts as u32,
                error,
            });
        }
        Ok(dead)
    }
}

#[async_trait]
impl EventBus for SqliteBus {
    async fn declare_queue(&self, queue: &str, routing_keys: &[String]) -> Result<(), BusError> {
        self.declare_sync(queue, routing_keys)
    }

    async fn publish(&self, envelope: Envelope) -> Result<usize, BusError> {
        self.publish_sync(&envelope)
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        self.receive_sync(queue)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        self.ack_sync(delivery)
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, BusError> {
        self.nack_sync(delivery, error)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BusError> {
        self.dead_letters_sync(queue)
    }

    async fn purge_settled(&self, older_than: Duration) -> Result<usize, BusError> {
        self.purge_settled_sync(older_than)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::publish_message;
    use crate::storage::SqliteStore;
    use crate::types::{OutboundSent, Network};
    use tokio_util::sync::CancellationToken;
    use rust_decimal_macros::dec;

    fn bus(max_attempts: u32) -> SqliteBus {
        let store = SqliteStore::in_memory().unwrap();
        SqliteBus::new(
            store.pool(),
            BusSettings {
                max_attempts,
                redelivery_delay: Duration::ZERO,
                visibility_timeout: Duration::from_secs(60),
            },
        )
        .unwrap()
    }

    fn sent(id: &str) -> OutboundSent {
        OutboundSent {
            withdrawal_id: id.to_string(),
            network: Network::Xrp,
            external_id: "HASH".to_string(),
            amount: dec!(25),
            fee: dec!(0.000015),
        }
    }

    #[tokio::test]
    async fn test_fanout_to_bound_queues() {
        let bus = bus(3);
        let key = vec!["payments.outboundRippleTransaction".to_string()];
        bus.declare_queue("confirmations", &key).await.unwrap();
        bus.declare_queue("audit", &key).await.unwrap();

        assert_eq!(publish_message(&bus, &sent("wd_1"), "dispatcher").await.unwrap(), 2);
        // Same dedup key is ignored, even after ack
        let delivery = bus.receive("confirmations").await.unwrap().unwrap();
        bus.ack(&delivery).await.unwrap();
        assert_eq!(publish_message(&bus, &sent("wd_1"), "dispatcher").await.unwrap(), 0);

        let decoded: OutboundSent = delivery.envelope.decode().unwrap();
        assert_eq!(decoded, sent("wd_1"));
    }

    #[tokio::test]
    async fn test_nack_then_dead_letter() {
        let bus = bus(2);
        bus.declare_queue("q", &["payments.outboundRippleTransaction".to_string()])
            .await
            .unwrap();
        publish_message(&bus, &sent("wd_2"), "dispatcher").await.unwrap();

        let first = bus.receive("q").await.unwrap().unwrap();
        assert!(bus.receive("q").await.unwrap().is_none());
        assert_eq!(bus.nack(&first, "rpc timeout").await.unwrap(), NackOutcome::Requeued);

        let second = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(bus.nack(&second, "rpc timeout").await.unwrap(), NackOutcome::DeadLettered);

        assert!(bus.receive("q").await.unwrap().is_none());
        let dead = bus.dead_letters("q").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope.message_type, "OutboundSent");
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let store = SqliteStore::in_memory().unwrap();
        let bus = SqliteBus::new(
            store.pool(),
            BusSettings {
                max_attempts: 5,
                redelivery_delay: Duration::ZERO,
                visibility_timeout: Duration::from_millis(5),
            },
        )
        .unwrap();
        bus.declare_queue("q", &["payments.outboundRippleTransaction".to_string()])
            .await
            .unwrap();
        publish_message(&bus, &sent("wd_3"), "dispatcher").await.unwrap();

        let _crashed = bus.receive("q").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        let retry = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(retry.attempt, 2);
    }

    fn message_count(bus: &SqliteBus) -> i64 {
        bus.conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM bus_messages", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_settled_messages() {
        let bus = bus(1);
        bus.declare_queue("q", &["payments.outboundRippleTransaction".to_string()])
            .await
            .unwrap();

        for i in 0..50 {
            publish_message(&bus, &sent(&format!("wd_{}", i)), "dispatcher").await.unwrap();
            let delivery = bus.receive("q").await.unwrap().unwrap();
            bus.ack(&delivery).await.unwrap();
        }
        publish_message(&bus, &sent("wd_dead"), "dispatcher").await.unwrap();
        let dead = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(bus.nack(&dead, "bad payload").await.unwrap(), NackOutcome::DeadLettered);
        publish_message(&bus, &sent("wd_open"), "dispatcher").await.unwrap();
        assert_eq!(message_count(&bus), 52);

        // Nothing is old enough yet
        assert_eq!(bus.purge_settled(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bus.purge_settled(Duration::ZERO).await.unwrap(), 51);
        assert_eq!(message_count(&bus), 1);

        // The unsettled message is still delivered and the dead letter survives
        let open: OutboundSent = bus.receive("q").await.unwrap().unwrap().envelope.decode().unwrap();
        assert_eq!(open.withdrawal_id, "wd_open");
        assert_eq!(bus.dead_letters("q").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retention_loop_stops_on_cancel() {
        let bus = bus(3);
        bus.declare_queue("q", &["payments.outboundRippleTransaction".to_string()])
            .await
            .unwrap();
        publish_message(&bus, &sent("wd_r"), "dispatcher").await.unwrap();
        let delivery = bus.receive("q").await.unwrap().unwrap();
        bus.ack(&delivery).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let sweep = crate::bus::run_retention(&bus, Duration::ZERO, Duration::from_millis(10), cancel.clone());
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(sweep, stop);
        result.unwrap();
        assert_eq!(message_count(&bus), 0);
    }
}
