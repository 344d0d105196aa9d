//! Event Bus
//!
//! Durable, at-least-once publish/subscribe with routed, typed messages.
//! Queues bind to routing keys; a message published to a key is copied into
//! every bound queue. Failed deliveries are redelivered after a delay until
//! `max_attempts`, then moved to the dead-letter store.

pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::common::ErrorKind;
use crate::types::BusMessage;

pub use consumer::{Consumer, MessageHandler};
pub use envelope::{Envelope, Headers};
pub use memory::InMemoryBus;
pub use sqlite::SqliteBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend error: {0}")]
    Backend(String),

    #[error("cannot decode message: {0}")]
    Decode(String),

    #[error("cannot encode message: {0}")]
    Encode(String),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Backend(_) => ErrorKind::Transient,
            // A malformed message will never decode, redelivering is pointless
            BusError::Decode(_) => ErrorKind::Validation,
            BusError::Encode(_) => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Deliveries before a message is dead-lettered
    pub max_attempts: u32,
    /// Base delay before a nacked message is visible again (scaled by attempt)
    pub redelivery_delay: Duration,
    /// A received but unsettled message becomes visible again after this
    pub visibility_timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            redelivery_delay: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// A leased message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: i64,
    pub queue: String,
    pub envelope: Envelope,
    /// 1 on first delivery
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub envelope: Envelope,
    pub attempts: u32,
    pub error: String,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Create the queue if needed and bind it to `routing_keys`
    async fn declare_queue(&self, queue: &str, routing_keys: &[String]) -> Result<(), BusError>;

    /// Route to every bound queue. Returns how many queues accepted it; a
    /// queue that already holds the same dedup key does not count.
    async fn publish(&self, envelope: Envelope) -> Result<usize, BusError>;

    /// Lease the next visible message, if any
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BusError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, BusError>;

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BusError>;

    /// Drop settled messages published more than `older_than` ago. Their
    /// dedup keys stop suppressing republishes. Returns the number removed.
    async fn purge_settled(&self, older_than: Duration) -> Result<usize, BusError>;
}

/// Purge settled messages every `interval` until cancelled
pub async fn run_retention(
    bus: &dyn EventBus,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), BusError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let purged = bus.purge_settled(retention).await?;
        if purged > 0 {
            tracing::info!(target: "payments::bus", purged, "purged settled messages");
        }
    }
}

/// Wrap and publish a typed message
pub async fn publish_message<M: BusMessage>(
    bus: &dyn EventBus,
    message: &M,
    publisher: &str,
) -> Result<usize, BusError> {
    let envelope = Envelope::wrap(message, publisher)?;
    let routed = bus.publish(envelope).await?;
    tracing::debug!(
        target: "payments::bus",
        routing_key = %message.routing_key(),
        message_type = M::MESSAGE_TYPE,
        routed,
        "published"
    );
    Ok(routed)
}

/// Redelivery delay for the given attempt, capped at ten steps
pub(crate) fn redelivery_after(settings: &BusSettings, attempt: u32) -> Duration {
    settings.redelivery_delay * attempt.clamp(1, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_delay_grows_then_caps() {
        let settings = BusSettings {
            redelivery_delay: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(redelivery_after(&settings, 1), Duration::from_secs(2));
        assert_eq!(redelivery_after(&settings, 3), Duration::from_secs(6));
        assert_eq!(redelivery_after(&settings, 50), Duration::from_secs(20));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(BusError::Backend("locked".into()).kind(), ErrorKind::Transient);
        assert_eq!(BusError::Decode("bad json".into()).kind(), ErrorKind::Validation);
    }
}
