//! Inbound transaction feeds.
//!
//! A feed is the chain-specific notification channel the watcher listens
//! on: pushed custodial-provider webhooks for the UTXO chains, or a polled
//! block/ledger changefeed for EVM, Tron and Ripple. Feeds may replay
//! transfers after a reconnect; the watcher deduplicates.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::chain::rpc::{parse_quantity, RpcClient};
use crate::chain::ChainError;
use crate::common::{PaymentError, PaymentsConfig};
use crate::storage::WalletStore;
use crate::types::{from_base_units, parse_base_units, Network};

/// keccak256("Transfer(address,address,uint256)")
pub const ERC20_TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// One observed inbound transfer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundTransfer {
    pub network: Network,
    pub external_id: String,
    pub address: String,
    pub destination_tag: Option<u32>,
    pub amount: Decimal,
}

impl InboundTransfer {
    pub fn key(&self) -> String {
        format!("{}:{}", self.network, self.external_id)
    }
}

#[async_trait]
pub trait InboundFeed: Send {
    fn network(&self) -> Network;

    /// (Re)establish the subscription. Called at start and after every failure.
    async fn connect(&mut self) -> Result<(), PaymentError>;

    /// Next transfers; empty when there is nothing new. An error means the
    /// subscription is broken and must be re-established.
    async fn next_batch(&mut self) -> Result<Vec<InboundTransfer>, PaymentError>;

    /// The last batch was fully handled; polled feeds move past it
    fn commit(&mut self) {}

    /// Whether `next_batch` waits for data itself (push feeds)
    fn is_push(&self) -> bool {
        false
    }
}

// ============================================================================
// Custodial webhooks
// ============================================================================

/// Routes webhook notifications to the watcher of each network
#[derive(Clone, Default)]
pub struct WebhookInbox {
    senders: HashMap<Network, mpsc::Sender<InboundTransfer>>,
}

impl WebhookInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `network` and return the watcher side
    pub fn open(&mut self, network: Network, capacity: usize) -> WebhookFeed {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.senders.insert(network, tx);
        WebhookFeed { network, rx }
    }

    pub fn accepts(&self, network: Network) -> bool {
        self.senders.contains_key(&network)
    }

    pub async fn deliver(&self, transfer: InboundTransfer) -> Result<(), PaymentError> {
        let sender = self
            .senders
            .get(&transfer.network)
            .ok_or_else(|| PaymentError::validation(format!("no watcher for {}", transfer.network)))?;
        sender
            .send(transfer)
            .await
            .map_err(|_| PaymentError::Chain(ChainError::Transport("watcher stopped".to_string())))
    }
}

pub struct WebhookFeed {
    network: Network,
    rx: mpsc::Receiver<InboundTransfer>,
}

#[async_trait]
impl InboundFeed for WebhookFeed {
    fn network(&self) -> Network {
        self.network
    }

    async fn connect(&mut self) -> Result<(), PaymentError> {
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<InboundTransfer>, PaymentError> {
        let first = self
            .rx
            .recv()
            .await
            .ok_or_else(|| ChainError::Transport("webhook channel closed".to_string()))?;
        let mut batch = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        Ok(batch)
    }

    fn is_push(&self) -> bool {
        true
    }
}

// ============================================================================
// Polled changefeeds
// ============================================================================

/// Tracks which heights a polled feed has scanned
#[derive(Debug, Clone)]
pub struct BlockCursor {
    next: Option<u64>,
    /// End of the range handed out but not yet committed
    staged: Option<u64>,
    /// Blocks re-scanned behind the tip on first connect
    lookback: u64,
    /// Upper bound on heights fetched per batch
    max_span: u64,
}

impl BlockCursor {
    pub fn new(lookback: u64, max_span: u64) -> Self {
        Self {
            next: None,
            staged: None,
            lookback,
            max_span: max_span.max(1),
        }
    }

    /// Position the cursor on first connect; later reconnects resume from
    /// the last committed height
    pub fn start_at(&mut self, height: u64) {
        self.staged = None;
        if self.next.is_none() {
            self.next = Some(height.saturating_sub(self.lookback));
        }
    }

    /// Heights to scan given the current tip, if any
    pub fn pending(&self, height: u64) -> Option<RangeInclusive<u64>> {
        let next = self.next?;
        (next <= height).then(|| next..=height.min(next + self.max_span - 1))
    }

    pub fn advance(&mut self, scanned_to: u64) {
        self.next = Some(scanned_to + 1);
    }

    /// Remember the end of a fetched range until the batch is handled
    pub fn stage(&mut self, scanned_to: u64) {
        self.staged = Some(scanned_to);
    }

    pub fn commit(&mut self) {
        if let Some(to) = self.staged.take() {
            self.advance(to);
        }
    }
}

async fn watched_addresses(wallets: &dyn WalletStore, network: Network) -> Result<HashSet<String>, PaymentError> {
    Ok(wallets
        .list_by_network(network)
        .await?
        .into_iter()
        .map(|w| w.address.to_lowercase())
        .collect())
}

fn parse_err(what: &str) -> PaymentError {
    PaymentError::Chain(ChainError::Parse(what.to_string()))
}

/// Scans EVM blocks (native ETH) or Transfer logs (ERC-20)
pub struct EvmBlockFeed {
    network: Network,
    rpc: RpcClient,
    wallets: Arc<dyn WalletStore>,
    token: Option<(String, u32)>,
    cursor: BlockCursor,
}

impl EvmBlockFeed {
    pub fn new(rpc_url: &str, wallets: Arc<dyn WalletStore>, cursor: BlockCursor) -> Self {
        Self {
            network: Network::Eth,
            rpc: RpcClient::new(rpc_url),
            wallets,
            token: None,
            cursor,
        }
    }

    pub fn erc20(
        rpc_url: &str,
        wallets: Arc<dyn WalletStore>,
        cursor: BlockCursor,
        contract: &str,
        decimals: u32,
    ) -> Self {
        Self {
            network: Network::Erc20,
            token: Some((contract.to_lowercase(), decimals)),
            ..Self::new(rpc_url, wallets, cursor)
        }
    }

    async fn height(&self) -> Result<u64, PaymentError> {
        let raw: String = self.rpc.call("eth_blockNumber", json!([])).await?;
        u64::try_from(parse_quantity(&raw)?).map_err(|_| parse_err("block number out of range"))
    }
}

/// Native transfers in a block fetched with full transactions
pub fn parse_evm_block(block: &Value, watched: &HashSet<String>) -> Result<Vec<InboundTransfer>, PaymentError> {
    let Some(txs) = block["transactions"].as_array() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for tx in txs {
        let Some(to) = tx["to"].as_str().map(str::to_lowercase) else {
            continue;
        };
        if !watched.contains(&to) {
            continue;
        }
        let value = parse_quantity(tx["value"].as_str().unwrap_or("0x0"))?;
        if value == 0 {
            continue;
        }
        out.push(InboundTransfer {
            network: Network::Eth,
            external_id: tx["hash"].as_str().ok_or_else(|| parse_err("tx hash missing"))?.to_string(),
            address: to,
            destination_tag: None,
            amount: from_base_units(value, 18).ok_or_else(|| parse_err("value out of range"))?,
        });
    }
    Ok(out)
}

/// ERC-20 `Transfer` logs addressed to watched wallets
pub fn parse_transfer_logs(
    logs: &Value,
    watched: &HashSet<String>,
    decimals: u32,
) -> Result<Vec<InboundTransfer>, PaymentError> {
    let Some(logs) = logs.as_array() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for log in logs {
        if log["removed"].as_bool() == Some(true) {
            continue;
        }
        let Some(topic) = log["topics"].get(2).and_then(Value::as_str) else {
            continue;
        };
        // Indexed address: last 20 bytes of the 32-byte topic
        let to = format!("0x{}", &topic[topic.len().saturating_sub(40)..]).to_lowercase();
        if !watched.contains(&to) {
            continue;
        }
        let value = parse_quantity(log["data"].as_str().unwrap_or("0x0"))?;
        out.push(InboundTransfer {
            network: Network::Erc20,
            external_id: log["transactionHash"]
                .as_str()
                .ok_or_else(|| parse_err("log tx hash missing"))?
                .to_string(),
            address: to,
            destination_tag: None,
            amount: from_base_units(value, decimals).ok_or_else(|| parse_err("value out of range"))?,
        });
    }
    Ok(out)
}

#[async_trait]
impl InboundFeed for EvmBlockFeed {
    fn commit(&mut self) {
        self.cursor.commit();
    }

    fn network(&self) -> Network {
        self.network
    }

    async fn connect(&mut self) -> Result<(), PaymentError> {
        let height = self.height().await?;
        self.cursor.start_at(height);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<InboundTransfer>, PaymentError> {
        let height = self.height().await?;
        let Some(range) = self.cursor.pending(height) else {
            return Ok(Vec::new());
        };
        let watched = watched_addresses(self.wallets.as_ref(), self.network).await?;
        let end = *range.end();

        let mut out = Vec::new();
        match &self.token {
            Some((contract, decimals)) => {
                let filter = json!([{
                    "fromBlock": format!("0x{:x}", range.start()),
                    "toBlock": format!("0x{:x}", end),
                    "address": contract,
                    "topics": [ERC20_TRANSFER_TOPIC],
                }]);
                let logs: Value = self.rpc.call("eth_getLogs", filter).await?;
                out.extend(parse_transfer_logs(&logs, &watched, *decimals)?);
            }
            None => {
                for number in range {
                    let block: Value = self
                        .rpc
                        .call("eth_getBlockByNumber", json!([format!("0x{:x}", number), true]))
                        .await?;
                    out.extend(parse_evm_block(&block, &watched)?);
                }
            }
        }

        self.cursor.stage(end);
        Ok(out)
    }
}

/// Scans Tron blocks for TRX `TransferContract`s
pub struct TronBlockFeed {
    rpc: RpcClient,
    wallets: Arc<dyn WalletStore>,
    cursor: BlockCursor,
}

impl TronBlockFeed {
    pub fn new(base_url: &str, api_key: Option<&str>, wallets: Arc<dyn WalletStore>, cursor: BlockCursor) -> Self {
        let mut rpc = RpcClient::new(base_url);
        if let Some(key) = api_key {
            rpc = rpc.with_header("TRON-PRO-API-KEY", key);
        }
        Self { rpc, wallets, cursor }
    }

    async fn height(&self) -> Result<u64, PaymentError> {
        let block = self.rpc.post_json("wallet/getnowblock", &json!({})).await?;
        block["block_header"]["raw_data"]["number"]
            .as_u64()
            .ok_or_else(|| parse_err("tron block number missing"))
    }
}

pub fn parse_tron_block(block: &Value, watched: &HashSet<String>) -> Result<Vec<InboundTransfer>, PaymentError> {
    let Some(txs) = block["transactions"].as_array() else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for tx in txs {
        if tx["ret"][0]["contractRet"].as_str().map_or(false, |r| r != "SUCCESS") {
            continue;
        }
        let contract = &tx["raw_data"]["contract"][0];
        if contract["type"] != "TransferContract" {
            continue;
        }
        let value = &contract["parameter"]["value"];
        let Some(to) = value["to_address"].as_str() else {
            continue;
        };
        if !watched.contains(&to.to_lowercase()) {
            continue;
        }
        let sun = value["amount"].as_u64().unwrap_or(0);
        if sun == 0 {
            continue;
        }
        out.push(InboundTransfer {
            network: Network::Trx,
            external_id: tx["txID"].as_str().ok_or_else(|| parse_err("txID missing"))?.to_string(),
            address: to.to_string(),
            destination_tag: None,
            amount: from_base_units(u128::from(sun), 6).ok_or_else(|| parse_err("amount out of range"))?,
        });
    }
    Ok(out)
}

#[async_trait]
impl InboundFeed for TronBlockFeed {
    fn commit(&mut self) {
        self.cursor.commit();
    }

    fn network(&self) -> Network {
        Network::Trx
    }

    async fn connect(&mut self) -> Result<(), PaymentError> {
        let height = self.height().await?;
        self.cursor.start_at(height);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<InboundTransfer>, PaymentError> {
        let height = self.height().await?;
        let Some(range) = self.cursor.pending(height) else {
            return Ok(Vec::new());
        };
        let watched = watched_addresses(self.wallets.as_ref(), Network::Trx).await?;
        let end = *range.end();

        let mut out = Vec::new();
        for number in range {
            let block = self
                .rpc
                .post_json("wallet/getblockbynum", &json!({ "num": number, "visible": true }))
                .await?;
            out.extend(parse_tron_block(&block, &watched)?);
        }

        self.cursor.stage(end);
        Ok(out)
    }
}

/// Follows payments into the shared Ripple account via `account_tx`
pub struct RippleAccountFeed {
    rpc: RpcClient,
    account: String,
    cursor: BlockCursor,
}

impl RippleAccountFeed {
    pub fn new(rpc_url: &str, account: &str, cursor: BlockCursor) -> Self {
        Self {
            rpc: RpcClient::new(rpc_url),
            account: account.to_string(),
            cursor,
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, PaymentError> {
        let mut response = self
            .rpc
            .post_json("", &json!({ "method": method, "params": [params] }))
            .await?;
        let result = response["result"].take();
        if result["status"] == "error" {
            return Err(ChainError::Server {
                status: 200,
                body: result["error"].as_str().unwrap_or("unknown").to_string(),
            }
            .into());
        }
        Ok(result)
    }

    async fn validated_ledger(&self) -> Result<u64, PaymentError> {
        let result = self.request("ledger", json!({ "ledger_index": "validated" })).await?;
        result["ledger_index"]
            .as_u64()
            .or_else(|| result["ledger"]["ledger_index"].as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| parse_err("validated ledger index missing"))
    }
}

/// Inbound XRP payments to `account` from an `account_tx` result
pub fn parse_account_tx(result: &Value, account: &str) -> Vec<InboundTransfer> {
    let Some(entries) = result["transactions"].as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            // API v2 renamed `tx` to `tx_json` and moved the hash up
            let tx = entry.get("tx_json").or_else(|| entry.get("tx"))?;
            if tx["TransactionType"] != "Payment" || tx["Destination"].as_str() != Some(account) {
                return None;
            }
            if entry["meta"]["TransactionResult"] != "tesSUCCESS" {
                return None;
            }
            // delivered_amount, not Amount: partial payments deliver less
            let drops = entry["meta"]["delivered_amount"].as_str()?;
            let amount = parse_base_units(drops).and_then(|d| from_base_units(d, 6))?;
            let hash = entry["hash"].as_str().or_else(|| tx["hash"].as_str())?;
            Some(InboundTransfer {
                network: Network::Xrp,
                external_id: hash.to_string(),
                address: account.to_string(),
                destination_tag: tx["DestinationTag"].as_u64().and_then(|t| u32::try_from(t).ok()),
                amount,
            })
        })
        .collect()
}

#[async_trait]
impl InboundFeed for RippleAccountFeed {
    fn commit(&mut self) {
        self.cursor.commit();
    }

    fn network(&self) -> Network {
        Network::Xrp
    }

    async fn connect(&mut self) -> Result<(), PaymentError> {
        let ledger = self.validated_ledger().await?;
        self.cursor.start_at(ledger);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<InboundTransfer>, PaymentError> {
        let ledger = self.validated_ledger().await?;
        let Some(range) = self.cursor.pending(ledger) else {
            return Ok(Vec::new());
        };
        let result = self
            .request(
                "account_tx",
                json!({
                    "account": self.account,
                    "ledger_index_min": range.start(),
                    "ledger_index_max": range.end(),
                    "forward": true,
                }),
            )
            .await?;

        self.cursor.stage(*range.end());
        Ok(parse_account_tx(&result, &self.account))
    }
}

/// Build the polled feeds for every enabled non-custodial network.
/// Custodial networks are fed through `inbox` instead.
pub fn feeds_from_config(
    config: &PaymentsConfig,
    wallets: Arc<dyn WalletStore>,
    inbox: &mut WebhookInbox,
) -> Result<Vec<Box<dyn InboundFeed>>, PaymentError> {
    let mut feeds: Vec<Box<dyn InboundFeed>> = Vec::new();
    for network in config.enabled_networks() {
        let chain = config.chain(network)?;
        let cursor = BlockCursor::new(u64::from(chain.required_confirmations) * 2, 50);
        let feed: Box<dyn InboundFeed> = match network {
            Network::Btc | Network::Ltc | Network::Doge => Box::new(inbox.open(network, 256)),
            Network::Eth => Box::new(EvmBlockFeed::new(&chain.rpc_url, wallets.clone(), cursor)),
            Network::Erc20 => {
                let contract = chain
                    .token_contract
                    .as_deref()
                    .ok_or_else(|| PaymentError::validation("erc20 token contract not configured"))?;
                Box::new(EvmBlockFeed::erc20(
                    &chain.rpc_url,
                    wallets.clone(),
                    cursor,
                    contract,
                    chain.token_decimals,
                ))
            }
            Network::Trx => Box::new(TronBlockFeed::new(
                &chain.rpc_url,
                chain.api_key.as_deref(),
                wallets.clone(),
                cursor,
            )),
            Network::Xrp => {
                let Some(account) = chain.hot_wallet_address.as_deref() else {
                    tracing::warn!(target: "payments::deposit", "xrp enabled without a shared account, no feed");
                    continue;
                };
                Box::new(RippleAccountFeed::new(&chain.rpc_url, account, cursor))
            }
        };
        feeds.push(feed);
    }
    Ok(feeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn watched(addrs: &[&str]) -> HashSet<String> {
        addrs.iter().map(|a| a.to_lowercase()).collect()
    }

    #[test]
    fn test_block_cursor() {
        let mut cursor = BlockCursor::new(10, 5);
        assert!(cursor.pending(100).is_none());

        cursor.start_at(100);
        assert_eq!(cursor.pending(100), Some(90..=94));
        cursor.stage(94);
        cursor.commit();
        assert_eq!(cursor.pending(96), Some(95..=96));
        cursor.advance(96);
        assert!(cursor.pending(96).is_none());

        // Reconnect resumes from the last commit, dropping staged work
        cursor.stage(120);
        cursor.start_at(500);
        cursor.commit();
        assert_eq!(cursor.pending(500), Some(97..=101));
    }

    #[test]
    fn test_parse_evm_block() {
        let block = json!({
            "transactions": [
                { "hash": "0xabc", "to": "0xAAAA000000000000000000000000000000000001", "value": "0x6f05b59d3b20000" },
                { "hash": "0xdef", "to": "0xbbbb000000000000000000000000000000000002", "value": "0x1" },
                { "hash": "0x123", "to": null, "value": "0x0" }
            ]
        });
        let out = parse_evm_block(&block, &watched(&["0xaaaa000000000000000000000000000000000001"])).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].external_id, "0xabc");
        assert_eq!(out[0].amount, dec!(0.5));
    }

    #[test]
    fn test_parse_transfer_logs() {
        let logs = json!([{
            "transactionHash": "0xfeed",
            "topics": [
                ERC20_TRANSFER_TOPIC,
                "0x0000000000000000000000009999999999999999999999999999999999999999",
                "0x000000000000000000000000aaaa000000000000000000000000000000000001"
            ],
            "data": "0x0000000000000000000000000000000000000000000000000000000000bebc20"
        }]);
        let out = parse_transfer_logs(&logs, &watched(&["0xaaaa000000000000000000000000000000000001"]), 6).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].amount, dec!(12.5));
        assert_eq!(out[0].network, Network::Erc20);
    }

    #[test]
    fn test_parse_tron_block() {
        let block = json!({
            "transactions": [{
                "txID": "t1",
                "ret": [{ "contractRet": "SUCCESS" }],
                "raw_data": { "contract": [{
                    "type": "TransferContract",
                    "parameter": { "value": { "to_address": "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7", "amount": 5000000 } }
                }]}
            }]
        });
        let out = parse_tron_block(&block, &watched(&["TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7"])).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].amount, dec!(5));
        assert_eq!(out[0].address, "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7");
    }

    #[test]
    fn test_parse_account_tx_uses_delivered_amount() {
        let account = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";
        let result = json!({
            "transactions": [
                {
                    "meta": { "TransactionResult": "tesSUCCESS", "delivered_amount": "2500000" },
                    "tx": { "TransactionType": "Payment", "Destination": account, "DestinationTag": 42,
                            "Amount": "9000000", "hash": "H1" },
                    "validated": true
                },
                {
                    "meta": { "TransactionResult": "tesSUCCESS", "delivered_amount": "1" },
                    "tx": { "TransactionType": "Payment", "Destination": "rOther", "hash": "H2" }
                }
            ]
        });
        let out = parse_account_tx(&result, account);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].amount, dec!(2.5));
        assert_eq!(out[0].destination_tag, Some(42));
    }

    #[tokio::test]
    async fn test_webhook_inbox_batches() {
        let mut inbox = WebhookInbox::new();
        let mut feed = inbox.open(Network::Btc, 8);
        assert!(inbox.accepts(Network::Btc));
        assert!(!inbox.accepts(Network::Eth));

        for hash in ["a", "b"] {
            inbox
                .deliver(InboundTransfer {
                    network: Network::Btc,
                    external_id: hash.to_string(),
                    address: "bc1q".to_string(),
                    destination_tag: None,
                    amount: dec!(0.1),
                })
                .await
                .unwrap();
        }
        let batch = feed.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
    }
}
