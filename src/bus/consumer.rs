//! Queue consumer loop.
//!
//! Runs N tasks against one queue. Each task handles one message at a time
//! and settles it according to the error kind:
//!
//! | outcome                  | settlement            |
//! |--------------------------|-----------------------|
//! | Ok / Duplicate           | ack                   |
//! | Validation / Reversion   | ack (logged, dropped) |
//! | Transient                | nack (redeliver)      |
//! | Fatal                    | nack, stop consumer   |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Delivery, Envelope, EventBus, NackOutcome};
use crate::alert::{Alert, Alerter, Severity};
use crate::common::{ErrorKind, PaymentError};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), PaymentError>;
}

pub struct Consumer {
    bus: Arc<dyn EventBus>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    alerter: Arc<dyn Alerter>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        bus: Arc<dyn EventBus>,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            bus,
            queue: queue.into(),
            handler,
            alerter,
            concurrency: 1,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Consume until cancelled. A fatal handler error stops every task and
    /// is returned to the caller.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), PaymentError> {
        let this = Arc::new(self);
        // Cancelled on shutdown or when a sibling hits a fatal error
        let local = cancel.child_token();

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..this.concurrency {
            let this = this.clone();
            let local = local.clone();
            tasks.spawn(async move {
                let result = this.consume(worker, &local).await;
                if result.is_err() {
                    local.cancel();
                }
                result
            });
        }

        tracing::info!(
            target: "payments::bus",
            queue = %this.queue,
            concurrency = this.concurrency,
            "consumer started"
        );

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| PaymentError::fatal(format!("consumer task panicked: {}", e)));
            if let Err(e) = result.and_then(|r| r) {
                local.cancel();
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(target: "payments::bus", queue = %this.queue, "consumer stopped");
        first_error.map_or(Ok(()), Err)
    }

    async fn consume(&self, worker: usize, cancel: &CancellationToken) -> Result<(), PaymentError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.bus.receive(&self.queue).await {
                Ok(Some(delivery)) => self.process(delivery).await?,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "payments::bus",
                        queue = %self.queue,
                        worker,
                        error = %e,
                        "receive failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.poll_interval * 4) => {}
                    }
                }
            }
        }
    }

    /// Handle and settle one delivery
    pub async fn process(&self, delivery: Delivery) -> Result<(), PaymentError> {
        let span = tracing::info_span!(
            "message",
            queue = %self.queue,
            message_type = %delivery.envelope.message_type,
            correlation_id = %delivery.envelope.headers.correlation_id,
            attempt = delivery.attempt
        );
        self.settle(delivery).instrument(span).await
    }

    async fn settle(&self, delivery: Delivery) -> Result<(), PaymentError> {
        let envelope = &delivery.envelope;
        let error = match self.handler.handle(envelope).await {
            Ok(()) => {
                self.bus.ack(&delivery).await?;
                return Ok(());
            }
            Err(e) => e,
        };

        match error.kind() {
            ErrorKind::Duplicate => {
                tracing::debug!(target: "payments::bus", error = %error, "duplicate delivery, acking");
                self.bus.ack(&delivery).await?;
                Ok(())
            }
            ErrorKind::Validation | ErrorKind::Reversion => {
                tracing::warn!(
                    target: "payments::bus",
                    code = error.error_code(),
                    error = %error,
                    "message rejected, not retrying"
                );
                self.bus.ack(&delivery).await?;
                Ok(())
            }
            ErrorKind::Transient => {
                let outcome = self.bus.nack(&delivery, &error.to_string()).await?;
                if outcome == NackOutcome::DeadLettered {
                    self.alerter
                        .alert(
                            Alert::new(
                                Severity::Critical,
                                format!("queue:{}", self.queue),
                                "message dead-lettered after exhausting retries",
                            )
                            .with_details(serde_json::json!({
                                "envelope_id": envelope.id,
                                "message_type": envelope.message_type,
                                "attempts": delivery.attempt,
                                "error": error.to_string(),
                            })),
                        )
                        .await;
                } else {
                    tracing::info!(
                        target: "payments::bus",
                        error = %error,
                        "transient failure, message requeued"
                    );
                }
                Ok(())
            }
            ErrorKind::Fatal => {
                tracing::error!(target: "payments::bus", error = %error, "fatal handler error");
                self.bus.nack(&delivery, &error.to_string()).await?;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::bus::{publish_message, BusSettings, InMemoryBus};
    use crate::types::{DepositDetected, Network};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    const KEY: &str = "payments.inboundEthereumTransaction";

    struct ScriptedHandler {
        calls: AtomicU32,
        fail_with: fn(u32) -> Option<PaymentError>,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, _envelope: &Envelope) -> Result<(), PaymentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match (self.fail_with)(n) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    async fn setup(max_attempts: u32) -> InMemoryBus {
        let bus = InMemoryBus::new(BusSettings {
            max_attempts,
            redelivery_delay: Duration::ZERO,
            visibility_timeout: Duration::from_secs(60),
        });
        bus.declare_queue("q", &[KEY.to_string()]).await.unwrap();
        let msg = DepositDetected {
            network: Network::Eth,
            external_id: "abc".to_string(),
            user_id: "u1".to_string(),
            address: "0xaddr".to_string(),
            amount: dec!(0.5),
        };
        publish_message(&bus, &msg, "test").await.unwrap();
        bus
    }

    fn consumer(bus: &InMemoryBus, handler: Arc<ScriptedHandler>, alerter: RecordingAlerter) -> Consumer {
        Consumer::new(Arc::new(bus.clone()), "q", handler, Arc::new(alerter))
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let bus = setup(5).await;
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_with: |n| (n == 0).then(|| PaymentError::busy("withdraw:u1")),
        });
        let c = consumer(&bus, handler.clone(), RecordingAlerter::new());

        let first = bus.receive("q").await.unwrap().unwrap();
        c.process(first).await.unwrap();
        let second = bus.receive("q").await.unwrap().unwrap();
        c.process(second).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(bus.pending("q").await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_is_acked() {
        let bus = setup(5).await;
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_with: |_| Some(PaymentError::validation("unsupported network")),
        });
        let c = consumer(&bus, handler, RecordingAlerter::new());

        let delivery = bus.receive("q").await.unwrap().unwrap();
        c.process(delivery).await.unwrap();
        assert!(bus.pending("q").await.is_empty());
        assert!(bus.dead_letters("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_raises_alert() {
        let bus = setup(1).await;
        let alerter = RecordingAlerter::new();
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_with: |_| Some(PaymentError::busy("x")),
        });
        let c = consumer(&bus, handler, alerter.clone());

        let delivery = bus.receive("q").await.unwrap().unwrap();
        c.process(delivery).await.unwrap();

        assert_eq!(bus.dead_letters("q").await.unwrap().len(), 1);
        assert_eq!(alerter.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_stops_run() {
        let bus = setup(5).await;
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_with: |_| Some(PaymentError::fatal("corrupt state")),
        });
        let c = consumer(&bus, handler, RecordingAlerter::new()).with_concurrency(3);

        let result = tokio::time::timeout(Duration::from_secs(5), c.run(CancellationToken::new()))
            .await
            .expect("consumer should stop on fatal error");
        assert!(matches!(result, Err(PaymentError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_consumer() {
        let bus = setup(5).await;
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_with: |_| None,
        });
        let c = consumer(&bus, handler.clone(), RecordingAlerter::new()).with_concurrency(2);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(c.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
