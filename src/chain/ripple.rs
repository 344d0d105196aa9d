//! Ripple JSON API client.
//!
//! XRP has no partial finality: a transaction is final once the ledger that
//! holds it is validated. Deposits go to one shared account and are told
//! apart by destination tag.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::rpc::RpcClient;
use super::signer::Signer;
use super::{is_base58, ChainClient, ChainError, Depth, FeePriority, OutboundTx, Receipt, ReceiptStatus};
use crate::types::{from_base_units, parse_base_units, to_base_units, Network};

const DROPS_DECIMALS: u32 = 6;

pub struct RippleClient {
    rpc: RpcClient,
    signer: Arc<dyn Signer>,
    /// Shared receiving account; deposits are identified by tag
    receive_address: Option<String>,
}

impl RippleClient {
    pub fn new(rpc_url: &str, signer: Arc<dyn Signer>, receive_address: Option<String>) -> Self {
        Self {
            rpc: RpcClient::new(rpc_url),
            signer,
            receive_address,
        }
    }

    /// Ripple wraps everything in `{"result": {...}}`, errors included
    async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({ "method": method, "params": [params] });
        let mut response = self.rpc.post_json("", &body).await?;
        Ok(response["result"].take())
    }

    fn error_code(result: &Value) -> Option<&str> {
        (result["status"] == "error").then(|| result["error"].as_str().unwrap_or("unknown"))
    }

    fn drops_to_xrp(raw: &str) -> Result<Decimal, ChainError> {
        parse_base_units(raw)
            .and_then(|drops| from_base_units(drops, DROPS_DECIMALS))
            .ok_or_else(|| ChainError::Parse(format!("invalid drops {:?}", raw)))
    }

    fn receipt_from(hash: &str, result: &Value) -> Receipt {
        let validated = result["validated"].as_bool().unwrap_or(false);
        let outcome = result["meta"]["TransactionResult"].as_str().unwrap_or("");
        // Only a validated tec/tef result is a final failure
        let status = if validated && !outcome.is_empty() && outcome != "tesSUCCESS" {
            ReceiptStatus::Reverted
        } else {
            ReceiptStatus::Success
        };
        Receipt {
            tx_hash: result["hash"].as_str().unwrap_or(hash).to_string(),
            status,
            block_number: result["ledger_index"].as_u64(),
            block_hash: None,
            depth: Depth::Validated(validated),
        }
    }

    /// Classify a `submit` engine result
    fn submit_outcome(engine_result: &str, message: &str) -> Result<(), ChainError> {
        match engine_result {
            "tesSUCCESS" | "terQUEUED" => Ok(()),
            // Local and retry codes: the node may still relay it, caller must not assume failure
            r if r.starts_with("tel") || r.starts_with("ter") => {
                Err(ChainError::Transport(format!("{}: {}", r, message)))
            }
            r => Err(ChainError::Rejected(format!("{}: {}", r, message))),
        }
    }
}

#[async_trait]
impl ChainClient for RippleClient {
    fn network(&self) -> Network {
        Network::Xrp
    }

    async fn get_current_height(&self) -> Result<u64, ChainError> {
        let result = self.request("ledger_current", json!({})).await?;
        result["ledger_current_index"]
            .as_u64()
            .ok_or_else(|| ChainError::Parse("ledger_current_index missing".to_string()))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        let result = self.request("tx", json!({ "transaction": hash })).await?;
        match Self::error_code(&result) {
            Some("txnNotFound") => Ok(None),
            Some(code) => Err(ChainError::Server {
                status: 200,
                body: code.to_string(),
            }),
            None => Ok(Some(Self::receipt_from(hash, &result))),
        }
    }

    async fn estimate_fee(&self, priority: FeePriority) -> Result<Decimal, ChainError> {
        let result = self.request("fee", json!({})).await?;
        let field = match priority {
            FeePriority::Low => "minimum_fee",
            FeePriority::Normal => "open_ledger_fee",
            FeePriority::High => "median_fee",
        };
        let drops = result["drops"][field]
            .as_str()
            .ok_or_else(|| ChainError::Parse(format!("fee.drops.{} missing", field)))?;
        Self::drops_to_xrp(drops)
    }

    async fn derive_address(&self, wallet_id: &str) -> Result<String, ChainError> {
        match &self.receive_address {
            Some(address) => Ok(address.clone()),
            None => self.signer.derive(Network::Xrp, wallet_id).await,
        }
    }

    async fn sign_and_broadcast(&self, tx: &OutboundTx) -> Result<String, ChainError> {
        self.validate_address(&tx.destination)?;
        let amount = to_base_units(tx.amount, DROPS_DECIMALS)
            .ok_or_else(|| ChainError::Rejected(format!("amount {} not representable", tx.amount)))?;
        let fee = to_base_units(tx.fee, DROPS_DECIMALS)
            .ok_or_else(|| ChainError::Rejected(format!("fee {} not representable", tx.fee)))?;

        let mut payment = json!({
            "TransactionType": "Payment",
            "Account": tx.source.address,
            "Destination": tx.destination,
            "Amount": amount.to_string(),
            "Fee": fee.to_string(),
        });
        if let Some(tag) = tx.destination_tag {
            payment["DestinationTag"] = json!(tag);
        }

        let signed = self.signer.sign(Network::Xrp, &tx.source.wallet_id, payment).await?;
        let result = self.request("submit", json!({ "tx_blob": signed.signed_tx })).await?;
        if let Some(code) = Self::error_code(&result) {
            return Err(ChainError::Rejected(code.to_string()));
        }

        let engine_result = result["engine_result"].as_str().unwrap_or("");
        let message = result["engine_result_message"].as_str().unwrap_or("");
        Self::submit_outcome(engine_result, message)?;

        result["tx_json"]["hash"]
            .as_str()
            .map(str::to_string)
            .or(signed.hash)
            .ok_or_else(|| ChainError::Parse("hash missing from submit response".to_string()))
    }

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let result = self
            .request(
                "account_info",
                json!({ "account": address, "ledger_index": "validated" }),
            )
            .await?;
        match Self::error_code(&result) {
            Some("actNotFound") => Ok(Decimal::ZERO),
            Some(code) => Err(ChainError::Server {
                status: 200,
                body: code.to_string(),
            }),
            None => Self::drops_to_xrp(result["account_data"]["Balance"].as_str().unwrap_or("0")),
        }
    }

    fn validate_address(&self, address: &str) -> Result<(), ChainError> {
        if (25..=35).contains(&address.len()) && address.starts_with('r') && is_base58(address) {
            Ok(())
        } else {
            Err(ChainError::InvalidAddress(format!("xrp address {}", address)))
        }
    }
}
