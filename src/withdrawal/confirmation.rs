//! Withdrawal Confirmation Worker
//!
//! Follows `Sending` withdrawals to finality. `Sending → Finished` is a single
//! transition with no ledger action; a reverted transaction moves to `Failed`
//! and the reservation is refunded. Work arrives both from `OutboundSent`
//! messages and from a periodic scan of `Sending` records. A broadcast whose
//! receipt never shows up is flagged for review once it is older than
//! `withdrawal_stuck_after`; the reservation stays in force.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::refund;
use crate::alert::{Alert, Alerter, Severity};
use crate::bus::{publish_message, Envelope, EventBus, MessageHandler};
use crate::chain::ChainRegistry;
use crate::common::{log_withdrawal_event, retry_transient, ErrorKind, PaymentError, PaymentsConfig};
use crate::ledger::LedgerService;
use crate::lock::{with_lock, LockManager, WITHDRAW_CONFIRM_NAMESPACE};
use crate::storage::WithdrawalStore;
use crate::types::{
    now_secs, OutboundConfirmed, OutboundSent, WithdrawalStats, WithdrawalStatus, WithdrawalTransaction,
};

const PUBLISHER: &str = "withdrawal-confirmation";

pub struct WithdrawalConfirmer {
    withdrawals: Arc<dyn WithdrawalStore>,
    chains: ChainRegistry,
    ledger: Arc<dyn LedgerService>,
    locks: Arc<dyn LockManager>,
    bus: Arc<dyn EventBus>,
    alerter: Arc<dyn Alerter>,
    config: Arc<PaymentsConfig>,
    stats: Mutex<WithdrawalStats>,
}

impl WithdrawalConfirmer {
    pub fn new(
        withdrawals: Arc<dyn WithdrawalStore>,
        chains: ChainRegistry,
        ledger: Arc<dyn LedgerService>,
        locks: Arc<dyn LockManager>,
        bus: Arc<dyn EventBus>,
        alerter: Arc<dyn Alerter>,
        config: Arc<PaymentsConfig>,
    ) -> Self {
        Self {
            withdrawals,
            chains,
            ledger,
            locks,
            bus,
            alerter,
            config,
            stats: Mutex::new(WithdrawalStats::default()),
        }
    }

    pub async fn stats(&self) -> WithdrawalStats {
        self.stats.lock().await.clone()
    }

    /// One locked confirmation cycle. `None` when another worker holds the lock.
    pub async fn process(&self, withdrawal_id: &str) -> Result<Option<WithdrawalStatus>, PaymentError> {
        with_lock(
            self.locks.as_ref(),
            WITHDRAW_CONFIRM_NAMESPACE,
            withdrawal_id,
            self.config.withdraw_lock_ttl,
            || self.advance(withdrawal_id),
        )
        .await
    }

    async fn advance(&self, withdrawal_id: &str) -> Result<WithdrawalStatus, PaymentError> {
        let mut record = self
            .withdrawals
            .get_by_id(withdrawal_id)
            .await?
            .ok_or_else(|| PaymentError::validation(format!("unknown withdrawal {}", withdrawal_id)))?;

        if record.status != WithdrawalStatus::Sending {
            // A refund interrupted on an earlier cycle is still owed
            self.refund(&mut record).await?;
            return Ok(record.status);
        }

        let hash = record
            .external_id
            .clone()
            .ok_or_else(|| PaymentError::fatal(format!("withdrawal {} is sending without a hash", record.id)))?;
        let client = self.chains.get(record.network)?;
        let policy = &self.config.retry;

        let receipt = retry_transient(policy, "get_transaction_receipt", || {
            client.get_transaction_receipt(&hash)
        })
        .await?;
        let Some(receipt) = receipt else {
            self.flag_if_stuck(&mut record, &hash).await?;
            return Ok(record.status);
        };

        if receipt.is_reverted() {
            record.mark_failed("reverted on chain")?;
            self.settle(&record, 0).await?;
            self.stats.lock().await.failed += 1;
            log_withdrawal_event(
                "withdrawal_reverted",
                &record.id,
                record.network,
                record.amount,
                &record.destination_address,
                Some(&hash),
                Some("reverted on chain"),
            );
            self.refund(&mut record).await?;
            return Ok(record.status);
        }

        let height = if receipt.needs_height() {
            retry_transient(policy, "get_current_height", || client.get_current_height()).await?
        } else {
            0
        };
        let confirmations = receipt.confirmations(height, 0);
        let required = self
            .config
            .chain(record.network)
            .map_err(|e| PaymentError::validation(e.to_string()))?
            .required_confirmations;

        if confirmations < required {
            tracing::debug!(
                target: "payments::withdrawal",
                withdrawal_id = %record.id,
                confirmations,
                required,
                "waiting for confirmations"
            );
            return Ok(record.status);
        }

        record.mark_finished()?;
        self.settle(&record, confirmations).await?;
        self.stats.lock().await.finished += 1;
        log_withdrawal_event(
            "withdrawal_finished",
            &record.id,
            record.network,
            record.amount,
            &record.destination_address,
            Some(&hash),
            None,
        );
        Ok(record.status)
    }

    async fn flag_if_stuck(&self, record: &mut WithdrawalTransaction, hash: &str) -> Result<(), PaymentError> {
        let age = now_secs().saturating_sub(record.updated_at);
        if age < self.config.withdrawal_stuck_after.as_secs() {
            return Ok(());
        }

        let reason = format!("no receipt for {} after {}s", hash, age);
        record.mark_flagged(reason.clone())?;
        self.withdrawals.update(record).await?;
        self.stats.lock().await.flagged += 1;
        log_withdrawal_event(
            "withdrawal_flagged",
            &record.id,
            record.network,
            record.amount,
            &record.destination_address,
            Some(hash),
            Some(reason.as_str()),
        );
        self.alerter
            .alert(
                Alert::new(Severity::Warning, PUBLISHER, "broadcast withdrawal never confirmed").with_details(
                    serde_json::json!({
                        "withdrawal_id": record.id,
                        "user_id": record.user_id,
                        "network": record.network,
                        "amount": record.amount.to_string(),
                        "tx_hash": hash,
                        "reason": reason,
                    }),
                ),
            )
            .await;
        Ok(())
    }

    /// Publish the outcome, then persist it
    async fn settle(&self, record: &WithdrawalTransaction, confirmations: u32) -> Result<(), PaymentError> {
        let message = OutboundConfirmed {
            withdrawal_id: record.id.clone(),
            network: record.network,
            external_id: record.external_id.clone().unwrap_or_default(),
            confirmations,
            status: record.status.to_string(),
        };
        retry_transient(&self.config.retry, "publish OutboundConfirmed", || {
            publish_message(self.bus.as_ref(), &message, PUBLISHER)
        })
        .await?;
        self.withdrawals.update(record).await?;
        Ok(())
    }

    async fn refund(&self, record: &mut WithdrawalTransaction) -> Result<(), PaymentError> {
        let refunded = refund(
            self.ledger.as_ref(),
            self.withdrawals.as_ref(),
            self.alerter.as_ref(),
            &self.config.retry,
            record,
        )
        .await?;
        if refunded {
            self.stats.lock().await.refunded += 1;
        }
        Ok(())
    }

    /// Run one cycle for every `Sending` withdrawal
    pub async fn scan_once(&self, concurrency: usize) -> Result<usize, PaymentError> {
        let sending = self.withdrawals.get_by_status(WithdrawalStatus::Sending).await?;
        let count = sending.len();

        let results: Vec<(String, Result<Option<WithdrawalStatus>, PaymentError>)> = stream::iter(sending)
            .map(|w| async move {
                let result = self.process(&w.id).await;
                (w.id, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for (id, result) in results {
            if let Err(e) = result {
                if e.kind() == ErrorKind::Fatal {
                    return Err(e);
                }
                tracing::warn!(
                    target: "payments::withdrawal",
                    withdrawal_id = %id,
                    code = e.error_code(),
                    error = %e,
                    "withdrawal confirmation cycle failed"
                );
            }
        }
        Ok(count)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PaymentError> {
        let mut ticker = tokio::time::interval(self.config.withdrawal_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.scan_once(self.config.consumers).await?;
        }

        let stats = self.stats().await;
        tracing::info!(target: "payments::withdrawal", stats = %stats, "withdrawal confirmer stopped");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for WithdrawalConfirmer {
    async fn handle(&self, envelope: &Envelope) -> Result<(), PaymentError> {
        let sent: OutboundSent = envelope.decode()?;
        // Busy means another worker is on it; the periodic scan covers the rest
        self.process(&sent.withdrawal_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlerter;
    use crate::bus::{BusSettings, InMemoryBus};
    use crate::chain::{ChainClient, Depth, MockChainClient, Receipt, ReceiptStatus};
    use crate::common::RetryPolicy;
    use crate::ledger::MemoryLedger;
    use crate::lock::MemoryLockManager;
    use crate::storage::MemoryStore;
    use crate::types::{outbound_confirmation_routing_key, Network, WithdrawalRequested};
    use rust_decimal_macros::dec;

    fn sending(id: &str, network: Network) -> WithdrawalTransaction {
        let mut record = WithdrawalTransaction::new(&WithdrawalRequested {
            request_id: id.to_string(),
            user_id: "u1".to_string(),
            network,
            amount: dec!(25),
            destination: "rDest".to_string(),
            destination_tag: None,
        });
        record.mark_processing().unwrap();
        record.mark_sending(format!("HASH-{}", id), dec!(0.000017)).unwrap();
        record
    }

    fn receipt(status: ReceiptStatus, depth: Depth, block: Option<u64>) -> Receipt {
        Receipt {
            tx_hash: "HASH".to_string(),
            status,
            block_number: block,
            block_hash: None,
            depth,
        }
    }

    struct Fixture {
        confirmer: WithdrawalConfirmer,
        store: MemoryStore,
        ledger: MemoryLedger,
        bus: InMemoryBus,
        alerter: Arc<RecordingAlerter>,
    }

    async fn fixture(client: MockChainClient, network: Network) -> Fixture {
        let store = MemoryStore::new();
        let ledger = MemoryLedger::new();
        let bus = InMemoryBus::new(BusSettings::default());
        bus.declare_queue("confirmed", &[outbound_confirmation_routing_key(network)])
            .await
            .unwrap();
        let mut config = PaymentsConfig::devnet();
        config.retry = RetryPolicy::immediate(2);
        let client: Arc<dyn ChainClient> = Arc::new(client);
        let alerter = Arc::new(RecordingAlerter::new());

        let confirmer = WithdrawalConfirmer::new(
            Arc::new(store.clone()),
            ChainRegistry::new().with_client(client),
            Arc::new(ledger.clone()),
            Arc::new(MemoryLockManager::new()),
            Arc::new(bus.clone()),
            alerter.clone(),
            Arc::new(config),
        );
        Fixture {
            confirmer,
            store,
            ledger,
            bus,
            alerter,
        }
    }

    #[tokio::test]
    async fn test_validated_ledger_finishes_once() {
        let mut client = MockChainClient::new();
        client.expect_network().return_const(Network::Xrp);
        client
            .expect_get_transaction_receipt()
            .times(1)
            .returning(|_| Ok(Some(receipt(ReceiptStatus::Success, Depth::Validated(true), Some(900)))));
        client.expect_get_current_height().never();
        let fx = fixture(client, Network::Xrp).await;
        WithdrawalStore::insert(&fx.store, &sending("w1", Network::Xrp)).await.unwrap();

        assert_eq!(fx.confirmer.process("w1").await.unwrap(), Some(WithdrawalStatus::Finished));
        // Terminal now, the chain is not asked again
        assert_eq!(fx.confirmer.process("w1").await.unwrap(), Some(WithdrawalStatus::Finished));

        assert!(fx.ledger.entries().await.is_empty());
        let published = fx.bus.pending("confirmed").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].body["status"], "finished");
        assert_eq!(fx.confirmer.stats().await.finished, 1);
    }

    #[tokio::test]
    async fn test_unvalidated_ledger_keeps_sending() {
        let mut client = MockChainClient::new();
        client.expect_network().return_const(Network::Xrp);
        client
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(ReceiptStatus::Success, Depth::Validated(false), None))));
        let fx = fixture(client, Network::Xrp).await;
        WithdrawalStore::insert(&fx.store, &sending("w2", Network::Xrp)).await.unwrap();

        assert_eq!(fx.confirmer.process("w2").await.unwrap(), Some(WithdrawalStatus::Sending));
        assert!(fx.bus.pending("confirmed").await.is_empty());
    }

    #[tokio::test]
    async fn test_reverted_withdrawal_is_refunded() {
        let mut client = MockChainClient::new();
        client.expect_network().return_const(Network::Eth);
        client
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(ReceiptStatus::Reverted, Depth::Included, Some(10)))));
        let fx = fixture(client, Network::Eth).await;
        WithdrawalStore::insert(&fx.store, &sending("w3", Network::Eth)).await.unwrap();

        assert_eq!(fx.confirmer.process("w3").await.unwrap(), Some(WithdrawalStatus::Failed));

        let refunds = fx.ledger.entries_for("w3:refund").await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].delta, dec!(25));
        let stored = WithdrawalStore::get_by_id(&fx.store, "w3").await.unwrap().unwrap();
        assert!(!stored.debited);
        assert_eq!(fx.bus.pending("confirmed").await[0].body["status"], "failed");
    }

    #[tokio::test]
    async fn test_scan_covers_block_depth_networks() {
        let mut client = MockChainClient::new();
        client.expect_network().return_const(Network::Eth);
        client
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(ReceiptStatus::Success, Depth::Included, Some(100)))));
        client.expect_get_current_height().returning(|| Ok(112));
        let fx = fixture(client, Network::Eth).await;
        WithdrawalStore::insert(&fx.store, &sending("w4", Network::Eth)).await.unwrap();
        WithdrawalStore::insert(&fx.store, &sending("w5", Network::Eth)).await.unwrap();

        assert_eq!(fx.confirmer.scan_once(2).await.unwrap(), 2);
        assert!(fx
            .store
            .get_by_status(WithdrawalStatus::Sending)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(fx.confirmer.stats().await.finished, 2);
    }

    #[tokio::test]
    async fn test_missing_receipt_is_flagged_once_stale() {
        let mut client = MockChainClient::new();
        client.expect_network().return_const(Network::Xrp);
        client.expect_get_transaction_receipt().returning(|_| Ok(None));
        let fx = fixture(client, Network::Xrp).await;

        let fresh = sending("w6", Network::Xrp);
        WithdrawalStore::insert(&fx.store, &fresh).await.unwrap();
        assert_eq!(fx.confirmer.process("w6").await.unwrap(), Some(WithdrawalStatus::Sending));
        assert!(fx.alerter.alerts().await.is_empty());

        let mut stale = sending("w7", Network::Xrp);
        stale.updated_at -= 7 * 3600;
        WithdrawalStore::insert(&fx.store, &stale).await.unwrap();
        assert_eq!(fx.confirmer.process("w7").await.unwrap(), Some(WithdrawalStatus::Flagged));

        let stored = WithdrawalStore::get_by_id(&fx.store, "w7").await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Flagged);
        assert!(stored.debited);
        assert!(stored.reason.unwrap().contains("HASH-w7"));
        assert!(fx.ledger.entries().await.is_empty());

        let alerts = fx.alerter.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].details["withdrawal_id"], "w7");
        assert_eq!(fx.confirmer.stats().await.flagged, 1);

        // Flagged records leave the scan
        assert_eq!(fx.confirmer.scan_once(2).await.unwrap(), 1);
        assert_eq!(fx.alerter.alerts().await.len(), 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_future_is_send() {
        let mut client = MockChainClient::new();
        client.expect_network().return_const(Network::Xrp);
        let fx = fixture(client, Network::Xrp).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = fx.confirmer.run(cancel);
        assert_send(&run);
        run.await.unwrap();
    }
}
