//! Deposit Confirmation Worker
//!
//! Drives a deposit through `Initiated → Pending → Completed | Cancelled`:
//!
//! ```text
//! Initiated --(receipt observed)-------------> Pending
//! Pending   --(confirmations >= required)----> Completed   [ledger credit]
//! Pending   --(receipt reverted)-------------> Cancelled   [NO_TRANSACTION]
//! Pending   --(no receipt)-------------------> Pending     [confirmations kept]
//! ```
//!
//! Every cycle for one transaction runs under the `deposit-confirm` lock for
//! `network:external_id`, re-reads the record and re-fetches the receipt.
//! The ledger credit uses the deposit id as idempotency key and is issued
//! before `Completed` is persisted, so a crash in between is healed by the
//! next cycle re-crediting as a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::alert::{Alert, Alerter, Severity};
use crate::bus::{publish_message, Envelope, EventBus, MessageHandler};
use crate::chain::ChainRegistry;
use crate::common::{log_deposit_event, retry_transient, ErrorKind, PaymentError, PaymentsConfig};
use crate::ledger::{LedgerOutcome, LedgerService};
use crate::lock::{with_lock, LockManager, DEPOSIT_CONFIRM_NAMESPACE};
use crate::storage::{DepositStore, StorageError};
use crate::types::{
    CancelReason, DepositDetected, DepositSettled, DepositStatus, DepositTransaction, Network,
};

const PUBLISHER: &str = "deposit-confirmation";

/// Counters for one worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepositStats {
    pub registered: u64,
    pub cycles: u64,
    pub skipped_locked: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub errors: u64,
}

impl std::fmt::Display for DepositStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Deposits: {} registered | {} cycles | {} locked | {} completed | {} cancelled | {} errors",
            self.registered, self.cycles, self.skipped_locked, self.completed, self.cancelled, self.errors
        )
    }
}

pub struct DepositConfirmer {
    deposits: Arc<dyn DepositStore>,
    chains: ChainRegistry,
    ledger: Arc<dyn LedgerService>,
    locks: Arc<dyn LockManager>,
    bus: Arc<dyn EventBus>,
    alerter: Arc<dyn Alerter>,
    config: Arc<PaymentsConfig>,
    stats: Mutex<DepositStats>,
}

impl DepositConfirmer {
    pub fn new(
        deposits: Arc<dyn DepositStore>,
        chains: ChainRegistry,
        ledger: Arc<dyn LedgerService>,
        locks: Arc<dyn LockManager>,
        bus: Arc<dyn EventBus>,
        alerter: Arc<dyn Alerter>,
        config: Arc<PaymentsConfig>,
    ) -> Self {
        Self {
            deposits,
            chains,
            ledger,
            locks,
            bus,
            alerter,
            config,
            stats: Mutex::new(DepositStats::default()),
        }
    }

    pub async fn stats(&self) -> DepositStats {
        self.stats.lock().await.clone()
    }

    fn required_confirmations(&self, network: Network) -> Result<u32, PaymentError> {
        self.config
            .chain(network)
            .map(|c| c.required_confirmations)
            .map_err(|e| PaymentError::validation(e.to_string()))
    }

    /// Persist a newly detected deposit; an already known transaction is left as is
    pub async fn register(&self, detected: &DepositDetected) -> Result<DepositTransaction, PaymentError> {
        self.required_confirmations(detected.network)?;

        let record = DepositTransaction::new(
            detected.user_id.clone(),
            detected.network,
            detected.external_id.clone(),
            detected.address.clone(),
            detected.amount,
        );

        match self.deposits.insert(&record).await {
            Ok(()) => {
                self.stats.lock().await.registered += 1;
                log_deposit_event(
                    "deposit_registered",
                    &record.id,
                    record.network,
                    &record.external_id,
                    record.amount,
                    None,
                );
                Ok(record)
            }
            Err(StorageError::Duplicate(_)) => {
                tracing::debug!(
                    target: "payments::deposit",
                    network = %detected.network,
                    external_id = %detected.external_id,
                    "deposit already registered"
                );
                self.deposits
                    .get_by_external_id(detected.network, &detected.external_id)
                    .await?
                    .ok_or_else(|| PaymentError::fatal("duplicate deposit vanished"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One locked confirmation cycle. `None` when another worker holds the lock.
    pub async fn process(&self, network: Network, external_id: &str) -> Result<Option<DepositStatus>, PaymentError> {
        let key = format!("{}:{}", network, external_id);
        let outcome = with_lock(
            self.locks.as_ref(),
            DEPOSIT_CONFIRM_NAMESPACE,
            &key,
            self.config.deposit_lock_ttl,
            || self.advance(network, external_id),
        )
        .await;

        let mut stats = self.stats.lock().await;
        match &outcome {
            Ok(Some(_)) => stats.cycles += 1,
            Ok(None) => stats.skipped_locked += 1,
            Err(_) => stats.errors += 1,
        }
        outcome
    }

    async fn advance(&self, network: Network, external_id: &str) -> Result<DepositStatus, PaymentError> {
        let policy = &self.config.retry;

        let mut record = self
            .deposits
            .get_by_external_id(network, external_id)
            .await?
            .ok_or_else(|| PaymentError::validation(format!("unknown deposit {}:{}", network, external_id)))?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }

        let client = self.chains.get(network)?;
        let receipt = retry_transient(policy, "get_transaction_receipt", || {
            client.get_transaction_receipt(external_id)
        })
        .await?;

        // Not on chain yet, or dropped back out: confirmations stay frozen
        let Some(receipt) = receipt else {
            return Ok(record.status);
        };

        if record.status == DepositStatus::Initiated {
            record.mark_pending()?;
        }

        if receipt.is_reverted() {
            record.mark_cancelled(CancelReason::NoTransaction)?;
            self.settle(&record).await?;
            self.stats.lock().await.cancelled += 1;
            log_deposit_event(
                "deposit_cancelled",
                &record.id,
                network,
                external_id,
                record.amount,
                Some(CancelReason::NoTransaction.code()),
            );
            return Ok(record.status);
        }

        let height = if receipt.needs_height() {
            retry_transient(policy, "get_current_height", || client.get_current_height()).await?
        } else {
            0
        };
        let confirmations = receipt.confirmations(height, record.confirmations);
        record.update_confirmations(confirmations, receipt.block_number, receipt.block_hash.clone());

        let required = self.required_confirmations(network)?;
        if record.confirmations < required {
            self.deposits.update(&record).await?;
            tracing::debug!(
                target: "payments::deposit",
                deposit_id = %record.id,
                confirmations = record.confirmations,
                required,
                "waiting for confirmations"
            );
            return Ok(record.status);
        }

        self.credit(&record).await?;
        record.mark_completed()?;
        self.settle(&record).await?;
        self.stats.lock().await.completed += 1;
        log_deposit_event("deposit_completed", &record.id, network, external_id, record.amount, None);
        Ok(record.status)
    }

    async fn credit(&self, record: &DepositTransaction) -> Result<(), PaymentError> {
        let meta = serde_json::json!({
            "type": "deposit",
            "network": record.network,
            "externalId": record.external_id,
            "address": record.address,
        });

        let result = retry_transient(&self.config.retry, "ledger credit", || {
            self.ledger
                .credit(&record.user_id, record.amount, &record.id, meta.clone())
        })
        .await;

        match result {
            Ok(LedgerOutcome::Applied) => Ok(()),
            Ok(LedgerOutcome::AlreadyApplied) => {
                tracing::info!(
                    target: "payments::deposit",
                    deposit_id = %record.id,
                    "credit already applied, finishing completion"
                );
                Ok(())
            }
            Err(e) => {
                if e.kind() == ErrorKind::Validation {
                    self.alerter
                        .alert(
                            Alert::new(Severity::Critical, "deposit-confirmation", "ledger refused deposit credit")
                                .with_details(serde_json::json!({
                                    "deposit_id": record.id,
                                    "user_id": record.user_id,
                                    "amount": record.amount.to_string(),
                                    "error": e.to_string(),
                                })),
                        )
                        .await;
                }
                Err(e.into())
            }
        }
    }

    /// Publish the terminal event, then persist the terminal state
    async fn settle(&self, record: &DepositTransaction) -> Result<(), PaymentError> {
        let message = DepositSettled {
            deposit_id: record.id.clone(),
            network: record.network,
            external_id: record.external_id.clone(),
            user_id: record.user_id.clone(),
            amount: record.amount,
            status: record.status.to_string(),
            reason: record.reason.clone(),
        };
        retry_transient(&self.config.retry, "publish DepositSettled", || {
            publish_message(self.bus.as_ref(), &message, PUBLISHER)
        })
        .await?;
        self.deposits.update(record).await?;
        Ok(())
    }

    /// Run one cycle for every non-terminal deposit. Returns the first fatal
    /// error; other failures are logged and retried next scan.
    pub async fn scan_once(&self, concurrency: usize) -> Result<usize, PaymentError> {
        let active = self.deposits.get_active(None).await?;
        let count = active.len();

        let results: Vec<(DepositTransaction, Result<Option<DepositStatus>, PaymentError>)> =
            stream::iter(active)
                .map(|d| async move {
                    let result = self.process(d.network, &d.external_id).await;
                    (d, result)
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        for (deposit, result) in results {
            if let Err(e) = result {
                if e.kind() == ErrorKind::Fatal {
                    return Err(e);
                }
                tracing::warn!(
                    target: "payments::deposit",
                    deposit_id = %deposit.id,
                    code = e.error_code(),
                    error = %e,
                    "confirmation cycle failed"
                );
            }
        }
        Ok(count)
    }

    /// Scan on the configured interval until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PaymentError> {
        let mut ticker = tokio::time::interval(self.config.deposit_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let scanned = self.scan_once(self.config.consumers).await?;
            tracing::debug!(target: "payments::deposit", scanned, "deposit scan finished");
        }

        let stats = self.stats().await;
        tracing::info!(target: "payments::deposit", stats = %stats, "deposit confirmer stopped");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for DepositConfirmer {
    async fn handle(&self, envelope: &Envelope) -> Result<(), PaymentError> {
        let detected: DepositDetected = envelope.decode()?;
        let record = self.register(&detected).await?;
        if !record.status.is_terminal() {
            self.process(record.network, &record.external_id).await?;
        }
        Ok(())
    }
}
