//! Withdrawal Dispatcher
//!
//! ```text
//! Waiting    --(validation fails)--------------> Failed
//! Waiting    --(debit)-------------------------> Processing
//! Processing --(amount >= review threshold)----> Flagged
//! Processing --(broadcast ok)------------------> Sending
//! Processing --(definite rejection)------------> Failed     [refund]
//! Processing --(broadcast outcome unknown)-----> Flagged
//! Flagged    --(review: approve)---------------> Processing
//! Flagged    --(review: reject)----------------> Rejected   [refund]
//! ```
//!
//! All work for one user runs under the `withdraw` lock keyed by user id, so
//! concurrent requests from the same account debit and broadcast one at a
//! time. `retries` counts broadcast attempts: a redelivered request found in
//! `Processing` with attempts on record may already be on chain and is held
//! for review instead of being sent twice.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::refund;
use crate::alert::{Alert, Alerter, Severity};
use crate::bus::{publish_message, Envelope, EventBus, MessageHandler};
use crate::chain::{ChainClient, ChainRegistry, FeePolicy, FeePriority, OutboundTx, SourceWallet};
use crate::common::{log_withdrawal_event, retry_transient, ChainConfig, PaymentError, PaymentsConfig};
use crate::ledger::{LedgerOutcome, LedgerService};
use crate::lock::{with_lock, LockManager, WITHDRAW_NAMESPACE};
use crate::storage::{StorageError, WithdrawalStore};
use crate::types::{
    BusMessage, OutboundSent, ReviewDecision, WithdrawalRequested, WithdrawalReview, WithdrawalStats,
    WithdrawalStatus, WithdrawalTransaction,
};

const PUBLISHER: &str = "withdrawal-dispatcher";

pub struct WithdrawalDispatcher {
    withdrawals: Arc<dyn WithdrawalStore>,
    chains: ChainRegistry,
    ledger: Arc<dyn LedgerService>,
    locks: Arc<dyn LockManager>,
    bus: Arc<dyn EventBus>,
    alerter: Arc<dyn Alerter>,
    config: Arc<PaymentsConfig>,
    stats: Mutex<WithdrawalStats>,
}

impl WithdrawalDispatcher {
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

    /// Accept a withdrawal request and carry it as far as it can go
    pub async fn request(&self, request: &WithdrawalRequested) -> Result<WithdrawalStatus, PaymentError> {
        let mut record = WithdrawalTransaction::new(request);

        match self.withdrawals.insert(&record).await {
            Ok(()) => {
                self.stats.lock().await.requested += 1;
                log_withdrawal_event(
                    "withdrawal_requested",
                    &record.id,
                    record.network,
                    record.amount,
                    &record.destination_address,
                    None,
                    None,
                );
            }
            Err(StorageError::Duplicate(_)) => {
                record = self
                    .withdrawals
                    .get_by_id(&request.request_id)
                    .await?
                    .ok_or_else(|| PaymentError::fatal("duplicate withdrawal vanished"))?;
                tracing::debug!(
                    target: "payments::withdrawal",
                    withdrawal_id = %record.id,
                    status = %record.status,
                    "withdrawal request redelivered"
                );
            }
            Err(e) => return Err(e.into()),
        }

        if record.status == WithdrawalStatus::Waiting {
            if let Err(e) = self.validate(&record) {
                record.mark_failed(e.to_string())?;
                self.withdrawals.update(&record).await?;
                self.stats.lock().await.failed += 1;
                log_withdrawal_event(
                    "withdrawal_invalid",
                    &record.id,
                    record.network,
                    record.amount,
                    &record.destination_address,
                    None,
                    Some(&e.to_string()),
                );
                return Ok(record.status);
            }
        }

        let id = record.id.clone();
        let outcome = with_lock(
            self.locks.as_ref(),
            WITHDRAW_NAMESPACE,
            &record.user_id,
            self.config.withdraw_lock_ttl,
            || self.dispatch(&id),
        )
        .await?;

        // Another withdrawal for this user is in flight; redeliver later
        outcome.ok_or_else(|| PaymentError::busy(format!("{}:{}", WITHDRAW_NAMESPACE, record.user_id)))
    }

    /// Synchronous checks that never need a retry
    pub fn validate(&self, record: &WithdrawalTransaction) -> Result<(), PaymentError> {
        let chain = self
            .config
            .chain(record.network)
            .map_err(|e| PaymentError::validation(e.to_string()))?;
        let client = self.chains.get(record.network)?;

        client.validate_address(&record.destination_address)?;

        if record.destination_tag.is_some() && !record.network.uses_destination_tag() {
            return Err(PaymentError::validation(format!(
                "{} does not use destination tags",
                record.network
            )));
        }

        if record.amount <= Decimal::ZERO {
            return Err(PaymentError::validation("amount must be positive"));
        }
        if record.amount < chain.min_withdrawal {
            return Err(PaymentError::validation(format!(
                "amount {} below minimum {}",
                record.amount, chain.min_withdrawal
            )));
        }
        if record.amount > chain.max_withdrawal {
            return Err(PaymentError::validation(format!(
                "amount {} above maximum {}",
                record.amount, chain.max_withdrawal
            )));
        }
        if record.amount.normalize().scale() > chain.decimals() {
            return Err(PaymentError::validation(format!(
                "amount {} has more than {} decimals",
                record.amount,
                chain.decimals()
            )));
        }
        if !record.network.is_custodial() && chain.hot_wallet_address.is_none() {
            return Err(PaymentError::validation(format!(
                "no hot wallet configured for {}",
                record.network
            )));
        }
        Ok(())
    }

    async fn dispatch(&self, id: &str) -> Result<WithdrawalStatus, PaymentError> {
        let mut record = self.load(id).await?;

        match record.status {
            WithdrawalStatus::Waiting => {
                if !self.debit(&mut record).await? {
                    return Ok(record.status);
                }
                if let Some(threshold) = self.chain(&record)?.review_threshold {
                    if record.amount >= threshold {
                        self.flag(&mut record, format!("amount at or above review threshold {}", threshold))
                            .await?;
                        return Ok(record.status);
                    }
                }
            }
            // Debited, never broadcast
            WithdrawalStatus::Processing if record.retries == 0 => {}
            WithdrawalStatus::Processing => {
                self.flag(&mut record, "interrupted during broadcast, outcome unknown").await?;
                return Ok(record.status);
            }
            _ => {
                self.refund(&mut record).await?;
                return Ok(record.status);
            }
        }

        self.send(&mut record).await?;
        Ok(record.status)
    }

    /// Reserve the balance. Returns false when the ledger refused.
    async fn debit(&self, record: &mut WithdrawalTransaction) -> Result<bool, PaymentError> {
        let meta = serde_json::json!({
            "type": "withdrawal",
            "network": record.network,
            "destination": record.destination_address,
            "destinationTag": record.destination_tag,
        });

        let result = retry_transient(&self.config.retry, "ledger debit", || {
            self.ledger
                .debit(&record.user_id, record.amount, &record.id, meta.clone())
        })
        .await;

        match result {
            Ok(LedgerOutcome::Applied) | Ok(LedgerOutcome::AlreadyApplied) => {
                record.mark_processing()?;
                self.withdrawals.update(record).await?;
                Ok(true)
            }
            Err(e) if !e.is_retryable() => {
                record.mark_failed(e.to_string())?;
                self.withdrawals.update(record).await?;
                self.stats.lock().await.failed += 1;
                log_withdrawal_event(
                    "withdrawal_debit_refused",
                    &record.id,
                    record.network,
                    record.amount,
                    &record.destination_address,
                    None,
                    Some(&e.to_string()),
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Estimate, sign and broadcast a debited withdrawal
    async fn send(&self, record: &mut WithdrawalTransaction) -> Result<(), PaymentError> {
        let chain = self.chain(record)?.clone();
        let client = self.chains.get(record.network)?;

        let fee = match self.fee(client.as_ref(), &chain).await {
            Ok(fee) => fee,
            Err(e) if !e.is_retryable() => return self.fail(record, e.to_string()).await,
            Err(e) => return Err(e),
        };

        let tx = OutboundTx {
            network: record.network,
            source: SourceWallet {
                wallet_id: chain
                    .wallet_id
                    .clone()
                    .unwrap_or_else(|| format!("hot:{}", record.network)),
                address: chain.hot_wallet_address.clone().unwrap_or_default(),
            },
            destination: record.destination_address.clone(),
            destination_tag: record.destination_tag,
            amount: record.amount,
            fee,
            reference: record.id.clone(),
        };

        record.increment_retries();
        self.withdrawals.update(record).await?;

        match client.sign_and_broadcast(&tx).await {
            Ok(hash) => {
                record.mark_sending(hash.clone(), fee)?;
                self.withdrawals.update(record).await?;
                self.stats.lock().await.sent += 1;
                log_withdrawal_event(
                    "withdrawal_sent",
                    &record.id,
                    record.network,
                    record.amount,
                    &record.destination_address,
                    Some(&hash),
                    None,
                );

                let sent = OutboundSent {
                    withdrawal_id: record.id.clone(),
                    network: record.network,
                    external_id: hash,
                    amount: record.amount,
                    fee,
                };
                retry_transient(&self.config.retry, "publish OutboundSent", || {
                    publish_message(self.bus.as_ref(), &sent, PUBLISHER)
                })
                .await?;
                Ok(())
            }
            Err(e) if e.is_definite_rejection() => self.fail(record, e.to_string()).await,
            Err(e) => {
                self.flag(record, format!("broadcast outcome unknown: {}", e)).await
            }
        }
    }

    /// Fee the transaction may spend, after multiplier, rounding and cap
    async fn fee(&self, client: &dyn ChainClient, chain: &ChainConfig) -> Result<Decimal, PaymentError> {
        let estimate = retry_transient(&self.config.retry, "estimate_fee", || {
            client.estimate_fee(FeePriority::Normal)
        })
        .await?;

        let policy = FeePolicy::from_config(chain);
        let fee = policy.apply(estimate, client.fee_decimals());
        if !policy.within_cap(estimate) {
            tracing::warn!(
                target: "payments::withdrawal",
                network = %chain.network,
                estimate = %estimate,
                fee = %fee,
                "fee estimate above cap, using cap"
            );
        }
        Ok(fee)
    }

    async fn fail(&self, record: &mut WithdrawalTransaction, reason: String) -> Result<(), PaymentError> {
        record.mark_failed(reason.clone())?;
        self.withdrawals.update(record).await?;
        self.stats.lock().await.failed += 1;
        log_withdrawal_event(
            "withdrawal_failed",
            &record.id,
            record.network,
            record.amount,
            &record.destination_address,
            None,
            Some(&reason),
        );
        self.refund(record).await
    }

    async fn flag(&self, record: &mut WithdrawalTransaction, reason: impl Into<String>) -> Result<(), PaymentError> {
        let reason = reason.into();
        record.mark_flagged(reason.clone())?;
        self.withdrawals.update(record).await?;
        self.stats.lock().await.flagged += 1;

        log_withdrawal_event(
            "withdrawal_flagged",
            &record.id,
            record.network,
            record.amount,
            &record.destination_address,
            None,
            None,
        );
        self.alerter
            .alert(
                Alert::new(Severity::Warning, PUBLISHER, "withdrawal held for review").with_details(
                    serde_json::json!({
                        "withdrawal_id": record.id,
                        "user_id": record.user_id,
                        "network": record.network,
                        "amount": record.amount.to_string(),
                        "reason": reason,
                    }),
                ),
            )
            .await;
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

    /// Apply an operator verdict to a flagged withdrawal
    pub async fn review(&self, review: &WithdrawalReview) -> Result<WithdrawalStatus, PaymentError> {
        let record = self
            .withdrawals
            .get_by_id(&review.withdrawal_id)
            .await?
            .ok_or_else(|| PaymentError::validation(format!("unknown withdrawal {}", review.withdrawal_id)))?;

        let outcome = with_lock(
            self.locks.as_ref(),
            WITHDRAW_NAMESPACE,
            &record.user_id,
            self.config.withdraw_lock_ttl,
            || self.apply_review(review),
        )
        .await?;

        outcome.ok_or_else(|| PaymentError::busy(format!("{}:{}", WITHDRAW_NAMESPACE, record.user_id)))
    }

    async fn apply_review(&self, review: &WithdrawalReview) -> Result<WithdrawalStatus, PaymentError> {
        let mut record = self.load(&review.withdrawal_id).await?;
        if record.status != WithdrawalStatus::Flagged {
            // Verdict already applied, or arrived for a record never flagged
            self.refund(&mut record).await?;
            return Ok(record.status);
        }

        tracing::info!(
            target: "payments::withdrawal",
            withdrawal_id = %record.id,
            decision = ?review.decision,
            reviewer = review.reviewer.as_deref().unwrap_or("unknown"),
            "applying review"
        );

        match review.decision {
            ReviewDecision::Approve => {
                record.mark_processing()?;
                self.withdrawals.update(&record).await?;
                self.send(&mut record).await?;
            }
            ReviewDecision::Reject => {
                let reason = review
                    .note
                    .clone()
                    .unwrap_or_else(|| "rejected by reviewer".to_string());
                record.mark_rejected(reason)?;
                self.withdrawals.update(&record).await?;
                self.stats.lock().await.rejected += 1;
                log_withdrawal_event(
                    "withdrawal_rejected",
                    &record.id,
                    record.network,
                    record.amount,
                    &record.destination_address,
                    None,
                    None,
                );
                self.refund(&mut record).await?;
            }
        }
        Ok(record.status)
    }

    async fn load(&self, id: &str) -> Result<WithdrawalTransaction, PaymentError> {
        self.withdrawals
            .get_by_id(id)
            .await?
            .ok_or_else(|| PaymentError::validation(format!("unknown withdrawal {}", id)))
    }

    fn chain(&self, record: &WithdrawalTransaction) -> Result<&ChainConfig, PaymentError> {
        self.config
            .chain(record.network)
            .map_err(|e| PaymentError::validation(e.to_string()))
    }
}

#[async_trait]
impl MessageHandler for WithdrawalDispatcher {
    async fn handle(&self, envelope: &Envelope) -> Result<(), PaymentError> {
        let status = if envelope.message_type == WithdrawalReview::MESSAGE_TYPE {
            self.review(&envelope.decode()?).await?
        } else {
            self.request(&envelope.decode()?).await?
        };
        tracing::debug!(target: "payments::withdrawal", message_id = %envelope.id, %status, "handled");
        Ok(())
    }
}
