//! HTTP client for the ledger service.
//!
//! `POST {base}/credit` and `POST {base}/debit` with an `Idempotency-Key`
//! header. A 409 means the key was already applied.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;

use super::{LedgerError, LedgerOutcome, LedgerService};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MutationBody<'a> {
    user_id: &'a str,
    amount: String,
    meta: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn mutate(
        &self,
        op: &str,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        let url = format!("{}/{}", self.base_url, op);
        let body = MutationBody {
            user_id,
            amount: amount.normalize().to_string(),
            meta,
        };

        let resp = self
            .client
            .post(&url)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        match status {
            s if s.is_success() => Ok(LedgerOutcome::Applied),
            StatusCode::CONFLICT => Ok(LedgerOutcome::AlreadyApplied),
            StatusCode::PAYMENT_REQUIRED => Err(LedgerError::InsufficientFunds(user_id.to_string())),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(LedgerError::Server {
                    status: s.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                })
            }
            _ => Err(LedgerError::Rejected(format!(
                "{} {}: {}",
                op,
                status.as_u16(),
                resp.text().await.unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl LedgerService for HttpLedgerClient {
    async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.mutate("credit", user_id, amount, idempotency_key, meta).await
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
        meta: serde_json::Value,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.mutate("debit", user_id, amount, idempotency_key, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_trimmed() {
        let client = HttpLedgerClient::new("http://ledger.local/api/");
        assert_eq!(client.base_url(), "http://ledger.local/api");
    }

    #[tokio::test]
    async fn test_unreachable_ledger_is_transient() {
        let client = HttpLedgerClient::new("http://127.0.0.1:1");
        let err = client
            .credit("u1", Decimal::ONE, "dep_1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
