//! Tron HTTP API client (`/wallet/*` endpoints, base58 addresses).

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::rpc::RpcClient;
use super::signer::Signer;
use super::{is_base58, ChainClient, ChainError, Depth, FeePriority, OutboundTx, Receipt, ReceiptStatus};
use crate::types::{from_base_units, to_base_units, Network};

const SUN_DECIMALS: u32 = 6;
/// Bandwidth consumed by a plain TRX transfer
const TRANSFER_BYTES: u128 = 270;

pub struct TronClient {
    rpc: RpcClient,
    signer: Arc<dyn Signer>,
}

impl TronClient {
    pub fn new(base_url: &str, api_key: Option<&str>, signer: Arc<dyn Signer>) -> Self {
        let mut rpc = RpcClient::new(base_url);
        if let Some(key) = api_key {
            rpc = rpc.with_header("TRON-PRO-API-KEY", key);
        }
        Self { rpc, signer }
    }

    fn sun_to_trx(sun: u128) -> Result<Decimal, ChainError> {
        from_base_units(sun, SUN_DECIMALS).ok_or_else(|| ChainError::Parse(format!("amount out of range: {}", sun)))
    }

    /// `gettransactioninfobyid` returns `{}` for unknown transactions
    fn receipt_from(hash: &str, info: &Value) -> Option<Receipt> {
        let block_number = info["blockNumber"].as_u64()?;
        let failed = info["result"].as_str() == Some("FAILED")
            || info["receipt"]["result"]
                .as_str()
                .map_or(false, |r| r != "SUCCESS");

        Some(Receipt {
            tx_hash: info["id"].as_str().unwrap_or(hash).to_string(),
            status: if failed {
                ReceiptStatus::Reverted
            } else {
                ReceiptStatus::Success
            },
            block_number: Some(block_number),
            block_hash: None,
            depth: Depth::Included,
        })
    }

    /// Tron returns broadcast errors as hex-encoded text
    fn decode_message(raw: &str) -> String {
        hex::decode(raw)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| raw.to_string())
    }
}

#[async_trait]
impl ChainClient for TronClient {
    fn network(&self) -> Network {
        Network::Trx
    }

    async fn get_current_height(&self) -> Result<u64, ChainError> {
        let block = self.rpc.post_json("wallet/getnowblock", &json!({})).await?;
        block["block_header"]["raw_data"]["number"]
            .as_u64()
            .ok_or_else(|| ChainError::Parse("block number missing".to_string()))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        let info = self
            .rpc
            .post_json("wallet/gettransactioninfobyid", &json!({ "value": hash }))
            .await?;
        Ok(Self::receipt_from(hash, &info))
    }

    async fn estimate_fee(&self, _priority: FeePriority) -> Result<Decimal, ChainError> {
        let params = self.rpc.post_json("wallet/getchainparameters", &json!({})).await?;
        let per_byte = params["chainParameter"]
            .as_array()
            .and_then(|list| {
                list.iter()
                    .find(|p| p["key"] == "getTransactionFee")
                    .and_then(|p| p["value"].as_u64())
            })
            .ok_or_else(|| ChainError::Parse("getTransactionFee missing".to_string()))?;
        Self::sun_to_trx(u128::from(per_byte) * TRANSFER_BYTES)
    }

    async fn derive_address(&self, wallet_id: &str) -> Result<String, ChainError> {
        let address = self.signer.derive(Network::Trx, wallet_id).await?;
        self.validate_address(&address)?;
        Ok(address)
    }

    async fn sign_and_broadcast(&self, tx: &OutboundTx) -> Result<String, ChainError> {
        self.validate_address(&tx.destination)?;
        let amount = to_base_units(tx.amount, SUN_DECIMALS)
            .ok_or_else(|| ChainError::Rejected(format!("amount {} not representable", tx.amount)))?;

        let unsigned = self
            .rpc
            .post_json(
                "wallet/createtransaction",
                &json!({
                    "owner_address": tx.source.address,
                    "to_address": tx.destination,
                    "amount": u64::try_from(amount).map_err(|e| ChainError::Rejected(e.to_string()))?,
                    "visible": true,
                }),
            )
            .await?;
        if let Some(err) = unsigned["Error"].as_str() {
            return Err(ChainError::Rejected(err.to_string()));
        }

        let signed = self.signer.sign(Network::Trx, &tx.source.wallet_id, unsigned).await?;
        let signed: Value = serde_json::from_str(&signed.signed_tx)
            .map_err(|e| ChainError::Parse(format!("signed transaction: {}", e)))?;

        let result = self.rpc.post_json("wallet/broadcasttransaction", &signed).await?;
        if result["result"].as_bool() == Some(true) {
            return result["txid"]
                .as_str()
                .or_else(|| signed["txID"].as_str())
                .map(str::to_string)
                .ok_or_else(|| ChainError::Parse("txid missing from broadcast response".to_string()));
        }

        let code = result["code"].as_str().unwrap_or("UNKNOWN");
        let message = Self::decode_message(result["message"].as_str().unwrap_or(""));
        match code {
            "SERVER_BUSY" | "NOT_ENOUGH_EFFECTIVE_CONNECTION" | "NO_CONNECTION" => {
                Err(ChainError::Transport(format!("{}: {}", code, message)))
            }
            _ => Err(ChainError::Rejected(format!("{}: {}", code, message))),
        }
    }

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let account = self
            .rpc
            .post_json("wallet/getaccount", &json!({ "address": address, "visible": true }))
            .await?;
        // Unactivated accounts come back as `{}`
        Self::sun_to_trx(u128::from(account["balance"].as_u64().unwrap_or(0)))
    }

    fn validate_address(&self, address: &str) -> Result<(), ChainError> {
        if address.len() == 34 && address.starts_with('T') && is_base58(address) {
            Ok(())
        } else {
            Err(ChainError::InvalidAddress(format!("trx address {}", address)))
        }
    }
}
