//! Withdrawal Pipeline
//!
//! - `dispatcher`: validate, reserve balance, sign and broadcast
//! - `confirmation`: follow broadcast transactions to finality
//!
//! Every path that ends in `Failed` or `Rejected` after the ledger debit
//! goes through [`refund`], which credits the reservation back under the
//! withdrawal's refund key.

pub mod confirmation;
pub mod dispatcher;

pub use confirmation::WithdrawalConfirmer;
pub use dispatcher::WithdrawalDispatcher;

use crate::alert::{Alert, Alerter, Severity};
use crate::common::{log_withdrawal_event, retry_transient, ErrorKind, PaymentError, RetryPolicy};
use crate::ledger::LedgerService;
use crate::storage::WithdrawalStore;
use crate::types::WithdrawalTransaction;

/// Credit back a failed or rejected withdrawal. No-op once refunded.
pub(crate) async fn refund(
    ledger: &dyn LedgerService,
    withdrawals: &dyn WithdrawalStore,
    alerter: &dyn Alerter,
    policy: &RetryPolicy,
    record: &mut WithdrawalTransaction,
) -> Result<bool, PaymentError> {
    if !record.needs_refund() {
        return Ok(false);
    }

    let user_id = record.user_id.clone();
    let amount = record.amount;
    let key = record.refund_key();
    let meta = serde_json::json!({
        "type": "withdrawal_refund",
        "withdrawalId": record.id,
        "network": record.network,
        "reason": record.reason,
    });

    let outcome = retry_transient(policy, "ledger refund", || {
        ledger.credit(&user_id, amount, &key, meta.clone())
    })
    .await;

    if let Err(e) = outcome {
        if e.kind() == ErrorKind::Validation {
            alerter
                .alert(
                    Alert::new(Severity::Critical, "withdrawal-refund", "ledger refused withdrawal refund")
                        .with_details(serde_json::json!({
                            "withdrawal_id": record.id,
                            "user_id": record.user_id,
                            "amount": record.amount.to_string(),
                            "error": e.to_string(),
                        })),
                )
                .await;
        }
        return Err(e.into());
    }

    record.mark_refunded();
    withdrawals.update(record).await?;
    log_withdrawal_event(
        "withdrawal_refunded",
        &record.id,
        record.network,
        record.amount,
        &record.destination_address,
        record.external_id.as_deref(),
        None,
    );
    Ok(true)
}
