//! Ethereum JSON-RPC client, native ETH and ERC-20 token transfers.
//!
//! Finality is block depth: `current_height - receipt.blockNumber`. A receipt
//! with `status = 0x0` is a reversion and is final.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use super::rpc::{abi_word, parse_quantity, RpcClient};
use super::signer::Signer;
use super::{ChainClient, ChainError, Depth, FeePriority, OutboundTx, Receipt, ReceiptStatus};
use crate::types::{from_base_units, to_base_units, Network};

/// `transfer(address,uint256)`
const ERC20_TRANSFER: &str = "a9059cbb";
/// `balanceOf(address)`
const ERC20_BALANCE_OF: &str = "70a08231";

const NATIVE_GAS_LIMIT: u128 = 21_000;
const TOKEN_GAS_LIMIT: u128 = 65_000;
const WEI_DECIMALS: u32 = 18;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    block_hash: Option<String>,
}

pub struct EvmClient {
    network: Network,
    rpc: RpcClient,
    signer: Arc<dyn Signer>,
    /// Token contract for `Network::Erc20`
    token_contract: Option<String>,
    token_decimals: u32,
}

impl EvmClient {
    pub fn new(rpc_url: &str, signer: Arc<dyn Signer>) -> Self {
        Self {
            network: Network::Eth,
            rpc: RpcClient::new(rpc_url),
            signer,
            token_contract: None,
            token_decimals: WEI_DECIMALS,
        }
    }

    /// Client for an ERC-20 token on the same node
    pub fn erc20(rpc_url: &str, signer: Arc<dyn Signer>, contract: &str, decimals: u32) -> Self {
        Self {
            network: Network::Erc20,
            rpc: RpcClient::new(rpc_url),
            signer,
            token_contract: Some(contract.to_lowercase()),
            token_decimals: decimals,
        }
    }

    fn gas_limit(&self) -> u128 {
        if self.token_contract.is_some() {
            TOKEN_GAS_LIMIT
        } else {
            NATIVE_GAS_LIMIT
        }
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let price: String = self.rpc.call("eth_gasPrice", json!([])).await?;
        parse_quantity(&price)
    }

    /// Unsigned transaction fields for the signer
    fn build_unsigned(
        &self,
        tx: &OutboundTx,
        nonce: u128,
        chain_id: u128,
    ) -> Result<Value, ChainError> {
        let amount = to_base_units(tx.amount, self.token_decimals)
            .ok_or_else(|| ChainError::Rejected(format!("amount {} not representable", tx.amount)))?;
        let max_fee = to_base_units(tx.fee, WEI_DECIMALS)
            .ok_or_else(|| ChainError::Rejected(format!("fee {} not representable", tx.fee)))?;
        let gas_price = max_fee / self.gas_limit();
        if gas_price == 0 {
            return Err(ChainError::Rejected("fee too small for gas limit".to_string()));
        }

        let (to, value, data) = match &self.token_contract {
            Some(contract) => (
                contract.clone(),
                0u128,
                format!(
                    "0x{}{}{}",
                    ERC20_TRANSFER,
                    abi_word(&tx.destination),
                    abi_word(&format!("{:x}", amount))
                ),
            ),
            None => (tx.destination.to_lowercase(), amount, "0x".to_string()),
        };

        Ok(json!({
            "from": tx.source.address,
            "to": to,
            "value": format!("0x{:x}", value),
            "data": data,
            "gas": format!("0x{:x}", self.gas_limit()),
            "gasPrice": format!("0x{:x}", gas_price),
            "nonce": format!("0x{:x}", nonce),
            "chainId": format!("0x{:x}", chain_id),
        }))
    }

    fn receipt_from(raw: RawReceipt) -> Result<Receipt, ChainError> {
        let block_number = raw.block_number.as_deref().map(parse_quantity).transpose()?;
        let status = match raw.status.as_deref() {
            Some("0x0") => ReceiptStatus::Reverted,
            _ => ReceiptStatus::Success,
        };
        Ok(Receipt {
            tx_hash: raw.transaction_hash,
            status,
            block_number: block_number.and_then(|b| u64::try_from(b).ok()),
            block_hash: raw.block_hash,
            depth: Depth::Included,
        })
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    fn network(&self) -> Network {
        self.network
    }

    fn fee_decimals(&self) -> u32 {
        // Gas is paid in ETH for token transfers too
        WEI_DECIMALS
    }

    async fn get_current_height(&self) -> Result<u64, ChainError> {
        let height: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        u64::try_from(parse_quantity(&height)?).map_err(|e| ChainError::Parse(e.to_string()))
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        let raw: Option<RawReceipt> = self.rpc.call("eth_getTransactionReceipt", json!([hash])).await?;
        raw.map(Self::receipt_from).transpose()
    }

    async fn estimate_fee(&self, priority: FeePriority) -> Result<Decimal, ChainError> {
        let price = self.gas_price().await?;
        let price = match priority {
            FeePriority::Low | FeePriority::Normal => price,
            FeePriority::High => price * 5 / 4,
        };
        from_base_units(price * self.gas_limit(), WEI_DECIMALS)
            .ok_or_else(|| ChainError::Parse("fee out of range".to_string()))
    }

    async fn derive_address(&self, wallet_id: &str) -> Result<String, ChainError> {
        let address = self.signer.derive(self.network, wallet_id).await?;
        self.validate_address(&address)?;
        Ok(address.to_lowercase())
    }

    async fn sign_and_broadcast(&self, tx: &OutboundTx) -> Result<String, ChainError> {
        self.validate_address(&tx.destination)?;

        let nonce: String = self
            .rpc
            .call("eth_getTransactionCount", json!([tx.source.address, "pending"]))
            .await?;
        let chain_id: String = self.rpc.call("eth_chainId", json!([])).await?;
        let unsigned = self.build_unsigned(tx, parse_quantity(&nonce)?, parse_quantity(&chain_id)?)?;

        let signed = self.signer.sign(self.network, &tx.source.wallet_id, unsigned).await?;
        self.rpc.call("eth_sendRawTransaction", json!([signed.signed_tx])).await
    }

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let raw: String = match &self.token_contract {
            Some(contract) => {
                let data = format!("0x{}{}", ERC20_BALANCE_OF, abi_word(address));
                self.rpc
                    .call("eth_call", json!([{ "to": contract, "data": data }, "latest"]))
                    .await?
            }
            None => self.rpc.call("eth_getBalance", json!([address, "latest"])).await?,
        };
        from_base_units(parse_quantity(&raw)?, self.token_decimals)
            .ok_or_else(|| ChainError::Parse(format!("balance out of range: {}", raw)))
    }

    fn validate_address(&self, address: &str) -> Result<(), ChainError> {
        let hex_part = address.strip_prefix("0x").unwrap_or("");
        if hex_part.len() == 40 && hex::decode(hex_part).is_ok() {
            Ok(())
        } else {
            Err(ChainError::InvalidAddress(format!("{} address {}", self.network, address)))
        }
    }
}
