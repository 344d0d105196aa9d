//! Process health, shared between workers, the supervisor and `/ready`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Ready,
    /// Shutdown requested, in-flight work is finishing
    Draining,
    Unavailable(String),
}

/// Cloneable handle over the current [`HealthState`]
#[derive(Debug, Clone)]
pub struct Health {
    tx: Arc<watch::Sender<HealthState>>,
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

impl Health {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HealthState::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> HealthState {
        self.tx.borrow().clone()
    }

    pub fn set(&self, state: HealthState) {
        tracing::info!(target: "payments::system", ?state, "health changed");
        self.tx.send_replace(state);
    }

    pub fn mark_ready(&self) {
        // Draining and Unavailable are sticky
        if matches!(self.state(), HealthState::Starting) {
            self.set(HealthState::Ready);
        }
    }

    pub fn mark_draining(&self) {
        self.set(HealthState::Draining);
    }

    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        self.set(HealthState::Unavailable(reason.into()));
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), HealthState::Ready)
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let health = Health::new();
        assert_eq!(health.state(), HealthState::Starting);
        assert!(!health.is_ready());

        health.mark_ready();
        assert!(health.is_ready());

        health.mark_draining();
        health.mark_ready();
        assert_eq!(health.state(), HealthState::Draining);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let health = Health::new();
        let mut rx = health.subscribe();

        health.mark_unavailable("deposit worker exhausted restarts");
        rx.changed().await.unwrap();
        assert!(matches!(&*rx.borrow(), HealthState::Unavailable(r) if r.contains("deposit")));
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_value(HealthState::Unavailable("x".to_string())).unwrap();
        assert_eq!(json["state"], "unavailable");
        assert_eq!(json["reason"], "x");
    }
}
