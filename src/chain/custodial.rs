//! Custodial wallet provider for the UTXO chains (BTC, LTC, DOGE).
//!
//! The provider holds the keys, signs sends itself and reports a
//! confirmation count per transfer.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use super::rpc::RpcClient;
use super::{is_base58, ChainClient, ChainError, Depth, FeePriority, OutboundTx, Receipt, ReceiptStatus};
use crate::types::{from_base_units, parse_base_units, to_base_units, Network};

/// Size used to turn a per-kB fee rate into a fee
const TYPICAL_TX_VBYTES: u128 = 250;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transfer {
    txid: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    confirmations: u32,
    #[serde(default)]
    height: Option<u64>,
    #[serde(default)]
    block_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeEstimate {
    fee_per_kb: u64,
}

#[derive(Debug, Deserialize)]
struct LatestBlock {
    height: u64,
}

#[derive(Debug, Clone)]
pub struct CustodialClient {
    network: Network,
    rpc: RpcClient,
    /// Provider coin identifier, e.g. `btc` or `tbtc`
    coin: String,
    wallet_id: String,
}

impl CustodialClient {
    pub fn new(network: Network, base_url: &str, api_key: Option<&str>, coin: &str, wallet_id: &str) -> Self {
        let mut rpc = RpcClient::new(base_url);
        if let Some(key) = api_key {
            rpc = rpc.with_header("Authorization", &format!("Bearer {}", key));
        }
        Self {
            network,
            rpc,
            coin: coin.to_string(),
            wallet_id: wallet_id.to_string(),
        }
    }

    fn wallet_path(&self, suffix: &str) -> String {
        format!("{}/wallet/{}/{}", self.coin, self.wallet_id, suffix)
    }

    fn decimals(&self) -> u32 {
        self.network.native_decimals()
    }

    fn receipt_from(transfer: Transfer) -> Receipt {
        let status = match transfer.state.as_str() {
            "failed" | "rejected" => ReceiptStatus::Reverted,
            _ => ReceiptStatus::Success,
        };
        Receipt {
            tx_hash: transfer.txid,
            status,
            block_number: transfer.height.filter(|h| *h > 0),
            block_hash: transfer.block_hash,
            depth: Depth::Reported(transfer.confirmations),
        }
    }
}

#[async_trait]
impl ChainClient for CustodialClient {
    fn network(&self) -> Network {
        self.network
    }

    async fn get_current_height(&self) -> Result<u64, ChainError> {
        let value = self
            .rpc
            .get_json(&format!("{}/public/block/latest", self.coin))
            .await?
            .ok_or_else(|| ChainError::Parse("latest block not found".to_string()))?;
        let block: LatestBlock = serde_json::from_value(value).map_err(|e| ChainError::Parse(e.to_string()))?;
        Ok(block.height)
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        let Some(value) = self.rpc.get_json(&self.wallet_path(&format!("transfer/{}", hash))).await? else {
            return Ok(None);
        };
        let transfer: Transfer = serde_json::from_value(value).map_err(|e| ChainError::Parse(e.to_string()))?;
        Ok(Some(Self::receipt_from(transfer)))
    }

    async fn estimate_fee(&self, priority: FeePriority) -> Result<Decimal, ChainError> {
        let blocks = match priority {
            FeePriority::Low => 12,
            FeePriority::Normal => 6,
            FeePriority::High => 2,
        };
        let value = self
            .rpc
            .get_json(&format!("{}/tx/fee?numBlocks={}", self.coin, blocks))
            .await?
            .ok_or_else(|| ChainError::Parse("fee estimate not found".to_string()))?;
        let estimate: FeeEstimate = serde_json::from_value(value).map_err(|e| ChainError::Parse(e.to_string()))?;

        let base_units = u128::from(estimate.fee_per_kb) * TYPICAL_TX_VBYTES / 1000;
        from_base_units(base_units, self.decimals())
            .ok_or_else(|| ChainError::Parse(format!("fee out of range: {}", base_units)))
    }

    async fn derive_address(&self, wallet_id: &str) -> Result<String, ChainError> {
        let value = self
            .rpc
            .post_json(&self.wallet_path("address"), &json!({ "label": wallet_id }))
            .await?;
        value["address"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Parse("address missing from response".to_string()))
    }

    async fn sign_and_broadcast(&self, tx: &OutboundTx) -> Result<String, ChainError> {
        self.validate_address(&tx.destination)?;
        let amount = to_base_units(tx.amount, self.decimals())
            .ok_or_else(|| ChainError::Rejected(format!("amount {} not representable", tx.amount)))?;
        let max_fee = to_base_units(tx.fee, self.decimals())
            .ok_or_else(|| ChainError::Rejected(format!("fee {} not representable", tx.fee)))?;

        let body = json!({
            "address": tx.destination,
            "amount": amount.to_string(),
            "maxFee": max_fee.to_string(),
            // Provider rejects a repeated sequence id, so a retried send cannot pay twice
            "sequenceId": tx.reference,
        });
        let value = self.rpc.post_json(&self.wallet_path("sendcoins"), &body).await?;
        value["txid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Parse("txid missing from send response".to_string()))
    }

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let Some(value) = self.rpc.get_json(&self.wallet_path(&format!("address/{}", address))).await? else {
            return Ok(Decimal::ZERO);
        };
        let raw = value["balance"]["balanceString"].as_str().unwrap_or("0");
        parse_base_units(raw)
            .and_then(|units| from_base_units(units, self.decimals()))
            .ok_or_else(|| ChainError::Parse(format!("invalid balance {:?}", raw)))
    }

    fn validate_address(&self, address: &str) -> Result<(), ChainError> {
        let bech32_prefixes: &[&str] = match self.network {
            Network::Btc => &["bc1", "tb1", "bcrt1"],
            Network::Ltc => &["ltc1", "tltc1"],
            _ => &[],
        };
        let legacy_prefixes: &[char] = match self.network {
            Network::Btc => &['1', '3', 'm', 'n', '2'],
            Network::Ltc => &['L', 'M', '3', 'm', 'n', 'Q'],
            Network::Doge => &['D', 'A', '9', 'n', '2'],
            _ => &[],
        };

        let lower = address.to_lowercase();
        let valid = if let Some(prefix) = bech32_prefixes.iter().find(|p| lower.starts_with(*p)) {
            (14..=74).contains(&address.len())
                && (address == lower || address == address.to_uppercase())
                && lower[prefix.len()..].chars().all(|c| c.is_ascii_alphanumeric() && !"1bio".contains(c))
        } else {
            (26..=35).contains(&address.len())
                && address.starts_with(legacy_prefixes)
                && is_base58(address)
        };

        if valid {
            Ok(())
        } else {
            Err(ChainError::InvalidAddress(format!("{} address {}", self.network, address)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(network: Network) -> CustodialClient {
        CustodialClient::new(network, "http://localhost:3080/api/v2", None, network.as_str(), "w1")
    }

    #[test]
    fn test_validate_addresses() {
        let btc = client(Network::Btc);
        assert!(btc.validate_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").is_ok());
        assert!(btc.validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").is_ok());
        assert!(btc.validate_address("0xdeadbeef").is_err());

        let doge = client(Network::Doge);
        assert!(doge.validate_address("DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L").is_ok());
        assert!(doge.validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").is_err());
    }

    #[test]
    fn test_transfer_states_map_to_receipts() {
        let pending: Transfer = serde_json::from_value(json!({
            "txid": "t1", "state": "unconfirmed", "confirmations": 0
        }))
        .unwrap();
        let receipt = CustodialClient::receipt_from(pending);
        assert_eq!(receipt.depth, Depth::Reported(0));
        assert!(receipt.block_number.is_none());

        let failed: Transfer = serde_json::from_value(json!({
            "txid": "t2", "state": "failed", "confirmations": 0
        }))
        .unwrap();
        assert!(CustodialClient::receipt_from(failed).is_reverted());
    }
}
