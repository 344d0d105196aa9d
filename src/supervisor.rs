//! Worker Supervisor
//!
//! Runs a long-lived worker as a spawned task and restarts it when it
//! returns an error, exits early or panics. Workers keep no state that is
//! not in storage, so a restart rebuilds everything from persisted records.
//! Once the restart budget is spent the process is marked unavailable and an
//! operator is alerted.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use tokio_util::sync::CancellationToken;

use crate::alert::{Alert, Alerter, Severity};
use crate::common::{Health, PaymentError, RetryPolicy};

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed before giving up
    pub max_restarts: u32,
    /// Delay schedule between restarts
    pub backoff: RetryPolicy,
    /// A run lasting this long resets the budget
    pub stable_after: Duration,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, backoff: RetryPolicy) -> Self {
        Self {
            max_restarts,
            backoff,
            stable_after: Duration::from_secs(300),
        }
    }
}

/// Keep `factory()` running until `cancel` fires.
///
/// Returns `Ok(())` on cancellation and an error once the restart budget is
/// exhausted.
pub async fn supervise<F, Fut>(
    name: &str,
    mut factory: F,
    policy: RestartPolicy,
    health: Health,
    alerter: Arc<dyn Alerter>,
    cancel: CancellationToken,
) -> Result<(), PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PaymentError>> + Send + 'static,
{
    let mut delays = policy.backoff.backoff();
    let mut restarts = 0u32;

    loop {
        tracing::info!(target: "payments::supervisor", worker = name, restarts, "starting worker");
        let started = Instant::now();
        let outcome = tokio::spawn(factory()).await;

        if cancel.is_cancelled() {
            if let Ok(Err(e)) = &outcome {
                tracing::warn!(target: "payments::supervisor", worker = name, error = %e, "worker failed during shutdown");
            }
            tracing::info!(target: "payments::supervisor", worker = name, "worker stopped");
            return Ok(());
        }

        let reason = match outcome {
            Ok(Ok(())) => "exited without being cancelled".to_string(),
            Ok(Err(e)) => format!("{} ({})", e, e.error_code()),
            Err(join) if join.is_panic() => format!("panicked: {}", join),
            Err(join) => format!("aborted: {}", join),
        };

        if started.elapsed() >= policy.stable_after {
            restarts = 0;
            delays.reset();
        }

        if restarts >= policy.max_restarts {
            let message = format!("{} out of restarts: {}", name, reason);
            health.mark_unavailable(message.clone());
            alerter
                .alert(
                    Alert::new(Severity::Critical, format!("supervisor:{}", name), "worker out of restarts")
                        .with_details(serde_json::json!({
                            "worker": name,
                            "restarts": restarts,
                            "last_error": reason,
                        })),
                )
                .await;
            return Err(PaymentError::fatal(message));
        }

        restarts += 1;
        let delay = delays.next_backoff().unwrap_or(policy.backoff.max_interval);
        tracing::warn!(
            target: "payments::supervisor",
            worker = name,
            reason = %reason,
            restart = restarts,
            max_restarts = policy.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "worker stopped unexpectedly, restarting"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::common::HealthState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy::new(max_restarts, RetryPolicy::immediate(1))
    }

    #[tokio::test]
    async fn test_restarts_until_success_then_cancel() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let alerter = Arc::new(RecordingAlerter::new());

        let factory = {
            let runs = runs.clone();
            let cancel = cancel.clone();
            move || {
                let runs = runs.clone();
                let cancel = cancel.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(PaymentError::fatal("boom"));
                    }
                    // Healthy run: stop the supervisor from inside
                    cancel.cancel();
                    Ok(())
                }
            }
        };

        let result = supervise("test", factory, policy(5), Health::new(), alerter.clone(), cancel).await;

        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(alerter.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_panics_count_against_budget() {
        let runs = Arc::new(AtomicU32::new(0));
        let health = Health::new();
        health.mark_ready();
        let alerter = Arc::new(RecordingAlerter::new());

        let factory = {
            let runs = runs.clone();
            move || {
                let runs = runs.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) < u32::MAX {
                        panic!("worker bug");
                    }
                    Ok(())
                }
            }
        };

        let result = supervise(
            "panicky",
            factory,
            policy(2),
            health.clone(),
            alerter.clone(),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        // First run plus two restarts
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(matches!(health.state(), HealthState::Unavailable(_)));
        let alerts = alerter.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }
}
