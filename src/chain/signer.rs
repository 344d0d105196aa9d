//! Opaque signing service.
//!
//! Key material never enters this process. The signer derives deposit
//! addresses and signs unsigned payloads built by the chain clients.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ChainError;
use crate::types::Network;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTx {
    /// Hex blob (EVM, Ripple) or JSON text (Tron)
    pub signed_tx: String,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DerivedAddress {
    address: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    async fn derive(&self, network: Network, wallet_id: &str) -> Result<String, ChainError>;

    async fn sign(&self, network: Network, wallet_id: &str, unsigned: Value) -> Result<SignedTx, ChainError>;
}

/// Signer reached over HTTP
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    client: Client,
    base_url: String,
}

impl RemoteSigner {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ChainError> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();

        if status.is_server_error() {
            return Err(ChainError::Server {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            // The signer refused: nothing was signed, nothing can reach the chain
            return Err(ChainError::Rejected(format!(
                "signer {}: {}",
                status.as_u16(),
                resp.text().await.unwrap_or_default()
            )));
        }
        resp.json().await.map_err(|e| ChainError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn derive(&self, network: Network, wallet_id: &str) -> Result<String, ChainError> {
        let derived: DerivedAddress = self
            .post("derive", json!({ "network": network, "walletId": wallet_id }))
            .await?;
        Ok(derived.address)
    }

    async fn sign(&self, network: Network, wallet_id: &str, unsigned: Value) -> Result<SignedTx, ChainError> {
        self.post(
            "sign",
            json!({ "network": network, "walletId": wallet_id, "payload": unsigned }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_tx_wire_format() {
        let signed: SignedTx = serde_json::from_value(json!({ "signedTx": "0xdead" })).unwrap();
        assert_eq!(signed.signed_tx, "0xdead");
        assert!(signed.hash.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_signer_is_transient() {
        let signer = RemoteSigner::new("http://127.0.0.1:1/");
        let err = signer.derive(Network::Eth, "eth:u1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
