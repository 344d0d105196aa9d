//! In-process bus for tests and single-process runs. Same delivery
//! semantics as the SQLite bus, without durability.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    redelivery_after, BusError, BusSettings, DeadLetter, Delivery, Envelope, EventBus, NackOutcome,
};

#[derive(Debug, Clone)]
struct Stored {
    id: i64,
    envelope: Envelope,
    attempts: u32,
    available_at: Instant,
    leased_until: Option<Instant>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    /// routing key -> queues
    bindings: HashMap<String, HashSet<String>>,
    queues: HashMap<String, Vec<Stored>>,
    /// Dedup keys with the time they were first published
    seen: HashMap<(String, String), Instant>,
    dead: Vec<DeadLetter>,
}

#[derive(Clone, Default)]
pub struct InMemoryBus {
    settings: BusSettings,
    state: Arc<Mutex<State>>,
}

impl InMemoryBus {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Messages in a queue that are not yet acked (test helper)
    pub async fn pending(&self, queue: &str) -> Vec<Envelope> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.iter().map(|s| s.envelope.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn declare_queue(&self, queue: &str, routing_keys: &[String]) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        for key in routing_keys {
            state
                .bindings
                .entry(key.clone())
                .or_default()
                .insert(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<usize, BusError> {
        let mut state = self.state.lock().await;
        let queues: Vec<String> = state
            .bindings
            .get(&envelope.routing_key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();

        let mut routed = 0;
        for queue in queues {
            if let Some(key) = &envelope.headers.dedup_key {
                let entry = (queue.clone(), key.clone());
                if state.seen.contains_key(&entry) {
                    continue;
                }
                state.seen.insert(entry, Instant::now());
            }
            state.next_id += 1;
            let stored = Stored {
                id: state.next_id,
                envelope: envelope.clone(),
                attempts: 0,
                available_at: Instant::now(),
                leased_until: None,
            };
            state.queues.entry(queue).or_default().push(stored);
            routed += 1;
        }
        Ok(routed)
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        let now = Instant::now();
        let visibility = self.settings.visibility_timeout;
        let mut state = self.state.lock().await;

        let Some(messages) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        let next = messages
            .iter_mut()
            .find(|m| m.available_at <= now && m.leased_until.map_or(true, |t| t <= now));

        Ok(next.map(|m| {
            m.attempts += 1;
            m.leased_until = Some(now + visibility);
            Delivery {
                delivery_id: m.id,
                queue: queue.to_string(),
                envelope: m.envelope.clone(),
                attempt: m.attempts,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if let Some(messages) = state.queues.get_mut(&delivery.queue) {
            messages.retain(|m| m.id != delivery.delivery_id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<NackOutcome, BusError> {
        let mut state = self.state.lock().await;
        let Some(messages) = state.queues.get_mut(&delivery.queue) else {
            return Ok(NackOutcome::Requeued);
        };
        let Some(pos) = messages.iter().position(|m| m.id == delivery.delivery_id) else {
            return Ok(NackOutcome::Requeued);
        };

        if messages[pos].attempts >= self.settings.max_attempts {
            let stored = messages.remove(pos);
            state.dead.push(DeadLetter {
                queue: delivery.queue.clone(),
                envelope: stored.envelope,
                attempts: stored.attempts,
                error: error.to_string(),
            });
            return Ok(NackOutcome::DeadLettered);
        }

        let m = &mut messages[pos];
        m.leased_until = None;
        m.available_at = Instant::now() + redelivery_after(&self.settings, m.attempts);
        Ok(NackOutcome::Requeued)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BusError> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().filter(|d| d.queue == queue).cloned().collect())
    }

    /// Acked messages are dropped immediately; only their dedup keys linger
    async fn purge_settled(&self, older_than: Duration) -> Result<usize, BusError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(cutoff) = Instant::now().checked_sub(older_than) else {
            return Ok(0);
        };
        let queues = &state.queues;

        let before = state.seen.len();
        state.seen.retain(|(queue, key), published| {
            let unsettled = queues.get(queue).map_or(false, |messages| {
                messages
                    .iter()
                    .any(|m| m.envelope.headers.dedup_key.as_deref() == Some(key.as_str()))
            });
            unsettled || *published >= cutoff
        });
        Ok(before - state.seen.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::publish_message;
    use crate::types::{DepositDetected, Network};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn detected(hash: &str) -> DepositDetected {
        DepositDetected {
            network: Network::Trx,
            external_id: hash.to_string(),
            user_id: "u1".to_string(),
            address: "T_addr".to_string(),
            amount: dec!(5),
        }
    }

    fn bus(max_attempts: u32) -> InMemoryBus {
        InMemoryBus::new(BusSettings {
            max_attempts,
            redelivery_delay: Duration::ZERO,
            visibility_timeout: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn test_routing_and_dedup() {
        let bus = bus(3);
        bus.declare_queue("deposits", &["payments.inboundTronTransaction".to_string()])
            .await
            .unwrap();

        assert_eq!(publish_message(&bus, &detected("h1"), "test").await.unwrap(), 1);
        assert_eq!(publish_message(&bus, &detected("h1"), "test").await.unwrap(), 0);
        assert_eq!(publish_message(&bus, &detected("h2"), "test").await.unwrap(), 1);
        assert_eq!(bus.pending("deposits").await.len(), 2);

        // Unbound routing key goes nowhere
        let mut other = detected("h3");
        other.network = Network::Xrp;
        assert_eq!(publish_message(&bus, &other, "test").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leased_message_is_invisible_until_settled() {
        let bus = bus(3);
        bus.declare_queue("q", &["payments.inboundTronTransaction".to_string()])
            .await
            .unwrap();
        publish_message(&bus, &detected("h1"), "test").await.unwrap();

        let delivery = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert!(bus.receive("q").await.unwrap().is_none());

        assert_eq!(bus.nack(&delivery, "timeout").await.unwrap(), NackOutcome::Requeued);
        let again = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);

        bus.ack(&again).await.unwrap();
        assert!(bus.receive("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let bus = bus(2);
        bus.declare_queue("q", &["payments.inboundTronTransaction".to_string()])
            .await
            .unwrap();
        publish_message(&bus, &detected("h1"), "test").await.unwrap();

        let first = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(bus.nack(&first, "boom").await.unwrap(), NackOutcome::Requeued);
        let second = bus.receive("q").await.unwrap().unwrap();
        assert_eq!(bus.nack(&second, "boom").await.unwrap(), NackOutcome::DeadLettered);

        assert!(bus.receive("q").await.unwrap().is_none());
        let dead = bus.dead_letters("q").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].error, "boom");
    }

    #[tokio::test]
    async fn test_purge_forgets_settled_dedup_keys() {
        let bus = bus(3);
        bus.declare_queue("q", &["payments.inboundTronTransaction".to_string()])
            .await
            .unwrap();
        publish_message(&bus, &detected("h1"), "test").await.unwrap();
        publish_message(&bus, &detected("h2"), "test").await.unwrap();
        let delivery = bus.receive("q").await.unwrap().unwrap();
        bus.ack(&delivery).await.unwrap();

        assert_eq!(bus.purge_settled(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        // h2 is still queued so its key stays
        assert_eq!(bus.purge_settled(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(publish_message(&bus, &detected("h2"), "test").await.unwrap(), 0);
        assert_eq!(publish_message(&bus, &detected("h1"), "test").await.unwrap(), 1);
    }
}
