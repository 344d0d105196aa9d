//! Deposit Watcher
//!
//! Listens on one network's inbound feed and publishes `DepositDetected`
//! once per observed transaction. Duplicates are filtered three ways: a
//! bounded in-process seen-set, the persisted deposit record, and the bus
//! dedup header.
//!
//! A broken feed is reconnected with jittered exponential backoff. After
//! `max_reconnects` consecutive failures an operator alert is raised and
//! the watcher returns the error to its supervisor.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use tokio_util::sync::CancellationToken;

use super::feeds::{InboundFeed, InboundTransfer};
use crate::alert::{Alert, Alerter, Severity};
use crate::bus::{publish_message, EventBus};
use crate::common::{retry_transient, PaymentError, RetryPolicy};
use crate::storage::{DepositStore, WalletStore};
use crate::types::{DepositDetected, Network};

const PUBLISHER: &str = "deposit-watcher";

/// Insertion-ordered set that forgets its oldest keys
#[derive(Debug)]
pub struct SeenSet {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&mut self, key: String) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatcherStats {
    pub observed: u64,
    pub published: u64,
    pub duplicates: u64,
    pub unknown_address: u64,
    pub reconnects: u64,
}

impl std::fmt::Display for WatcherStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Watcher: {} observed | {} published | {} duplicates | {} unknown | {} reconnects",
            self.observed, self.published, self.duplicates, self.unknown_address, self.reconnects
        )
    }
}

enum Session {
    Cancelled,
    Broken(PaymentError),
}

pub struct DepositWatcher {
    feed: Box<dyn InboundFeed>,
    wallets: Arc<dyn WalletStore>,
    deposits: Arc<dyn DepositStore>,
    bus: Arc<dyn EventBus>,
    alerter: Arc<dyn Alerter>,
    reconnect: RetryPolicy,
    retry: RetryPolicy,
    max_reconnects: u32,
    poll_interval: Duration,
    seen: SeenSet,
    stats: WatcherStats,
}

impl DepositWatcher {
    pub fn new(
        feed: Box<dyn InboundFeed>,
        wallets: Arc<dyn WalletStore>,
        deposits: Arc<dyn DepositStore>,
        bus: Arc<dyn EventBus>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            feed,
            wallets,
            deposits,
            bus,
            alerter,
            reconnect: RetryPolicy::default(),
            retry: RetryPolicy::default(),
            max_reconnects: 10,
            poll_interval: Duration::from_secs(15),
            seen: SeenSet::new(10_000),
            stats: WatcherStats::default(),
        }
    }

    /// Backoff between reconnects and the number of consecutive failures tolerated
    pub fn with_reconnect(mut self, policy: RetryPolicy, max_reconnects: u32) -> Self {
        self.reconnect = policy;
        self.max_reconnects = max_reconnects.max(1);
        self
    }

    /// Retry policy for store and bus calls while observing a transfer
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn network(&self) -> Network {
        self.feed.network()
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    /// Watch until cancelled, or until the feed stays broken past the reconnect budget
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), PaymentError> {
        let network = self.network();
        let mut backoff = self.reconnect.backoff();
        let mut failures: u32 = 0;

        tracing::info!(target: "payments::deposit", %network, "deposit watcher started");

        loop {
            let error = match self.feed.connect().await {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(target: "payments::deposit", %network, failures, "feed reconnected");
                    }
                    failures = 0;
                    backoff.reset();
                    match self.session(&cancel).await {
                        Session::Cancelled => break,
                        Session::Broken(e) => e,
                    }
                }
                Err(e) => e,
            };

            // Observing failed for a reason reconnecting cannot fix
            if !error.is_retryable() {
                return Err(error);
            }

            failures += 1;
            self.stats.reconnects += 1;
            tracing::warn!(
                target: "payments::deposit",
                %network,
                attempt = failures,
                max = self.max_reconnects,
                error = %error,
                "feed failed, reconnecting"
            );

            if failures >= self.max_reconnects {
                self.alerter
                    .alert(
                        Alert::new(
                            Severity::Critical,
                            format!("deposit-watcher:{}", network),
                            "inbound feed unavailable, reconnect attempts exhausted",
                        )
                        .with_details(serde_json::json!({
                            "attempts": failures,
                            "error": error.to_string(),
                        })),
                    )
                    .await;
                return Err(error);
            }

            let delay = backoff.next_backoff().unwrap_or(self.reconnect.max_interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(target: "payments::deposit", %network, stats = %self.stats, "deposit watcher stopped");
        Ok(())
    }

    async fn session(&mut self, cancel: &CancellationToken) -> Session {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Session::Cancelled,
                batch = self.feed.next_batch() => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => return Session::Broken(e),
            };

            let idle = batch.is_empty();
            for transfer in batch {
                if let Err(e) = self.observe(transfer).await {
                    return Session::Broken(e);
                }
            }
            self.feed.commit();

            if idle && !self.feed.is_push() {
                tokio::select! {
                    _ = cancel.cancelled() => return Session::Cancelled,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
    }

    /// Publish a transfer unless it was already seen or belongs to nobody
    pub async fn observe(&mut self, transfer: InboundTransfer) -> Result<bool, PaymentError> {
        self.stats.observed += 1;
        let key = transfer.key();

        if self.seen.contains(&key) {
            self.stats.duplicates += 1;
            return Ok(false);
        }

        let known = retry_transient(&self.retry, "deposit lookup", || {
            self.deposits.get_by_external_id(transfer.network, &transfer.external_id)
        })
        .await?;
        if known.is_some() {
            self.stats.duplicates += 1;
            self.seen.insert(key);
            return Ok(false);
        }

        let owner = retry_transient(&self.retry, "wallet lookup", || {
            self.wallets
                .find_owner(transfer.network, &transfer.address, transfer.destination_tag)
        })
        .await?;
        let Some(wallet) = owner else {
            tracing::warn!(
                target: "payments::deposit",
                network = %transfer.network,
                external_id = %transfer.external_id,
                address = %transfer.address,
                tag = ?transfer.destination_tag,
                "inbound transfer to unknown wallet, ignoring"
            );
            self.stats.unknown_address += 1;
            self.seen.insert(key);
            return Ok(false);
        };

        let message = DepositDetected {
            network: transfer.network,
            external_id: transfer.external_id.clone(),
            user_id: wallet.user_id,
            address: transfer.address.clone(),
            amount: transfer.amount,
        };
        retry_transient(&self.retry, "publish DepositDetected", || {
            publish_message(self.bus.as_ref(), &message, PUBLISHER)
        })
        .await?;

        crate::common::log_deposit_event(
            "deposit_detected",
            &key,
            transfer.network,
            &transfer.external_id,
            transfer.amount,
            None,
        );
        self.stats.published += 1;
        self.seen.insert(key);
        Ok(true)
    }
}
