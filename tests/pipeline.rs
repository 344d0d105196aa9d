//! End-to-end flows through the bus: watcher to ledger credit, and
//! withdrawal request to finality.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use payments::alert::RecordingAlerter;
use payments::bus::{BusSettings, Consumer, EventBus, InMemoryBus, MessageHandler, SqliteBus};
use payments::chain::{ChainClient, ChainError, ChainRegistry, Depth, FeePriority, OutboundTx, Receipt, ReceiptStatus};
use payments::common::{PaymentsConfig, RetryPolicy};
use payments::deposit::{DepositConfirmer, DepositWatcher, InboundTransfer, WebhookInbox};
use payments::ledger::MemoryLedger;
use payments::lock::{with_lock, LockManager, MemoryLockManager, SqliteLockManager, DEPOSIT_CONFIRM_NAMESPACE};
use payments::storage::{DepositStore, MemoryStore, SqliteStore, WalletStore, WithdrawalStore};
use payments::types::{
    inbound_routing_key, outbound_routing_key, CancelReason, DepositStatus, Network, Wallet,
    WithdrawalRequested, WithdrawalStatus, WITHDRAWAL_REQUEST_ROUTING_KEY,
};
use payments::withdrawal::{WithdrawalConfirmer, WithdrawalDispatcher};

const USER_ADDRESS: &str = "0xaaaa000000000000000000000000000000000001";
const XRP_HOT: &str = "rHotWa11etXXXXXXXXXXXXXXXXXXXXXXXX";
const XRP_DEST: &str = "rDestinati0nXXXXXXXXXXXXXXXXXXXXXX";

/// Scriptable chain client
struct FakeChain {
    network: Network,
    fee_decimals: u32,
    height: u64,
    fee_estimate: Decimal,
    receipts: Mutex<HashMap<String, Receipt>>,
    broadcasts: Mutex<Vec<OutboundTx>>,
    receipt_calls: AtomicU32,
}

impl FakeChain {
    fn new(network: Network, fee_decimals: u32, height: u64, fee_estimate: Decimal) -> Self {
        Self {
            network,
            fee_decimals,
            height,
            fee_estimate,
            receipts: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            receipt_calls: AtomicU32::new(0),
        }
    }

    fn set_receipt(&self, receipt: Receipt) {
        self.receipts.lock().unwrap().insert(receipt.tx_hash.clone(), receipt);
    }

    fn broadcasts(&self) -> Vec<OutboundTx> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn network(&self) -> Network {
        self.network
    }

    fn fee_decimals(&self) -> u32 {
        self.fee_decimals
    }

    async fn get_current_height(&self) -> Result<u64, ChainError> {
        Ok(self.height)
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.receipts.lock().unwrap().get(hash).cloned())
    }

    async fn estimate_fee(&self, _priority: FeePriority) -> Result<Decimal, ChainError> {
        Ok(self.fee_estimate)
    }

    async fn derive_address(&self, wallet_id: &str) -> Result<String, ChainError> {
        Ok(format!("addr-{}", wallet_id))
    }

    async fn sign_and_broadcast(&self, tx: &OutboundTx) -> Result<String, ChainError> {
        let mut broadcasts = self.broadcasts.lock().unwrap();
        broadcasts.push(tx.clone());
        Ok(format!("TX{}", broadcasts.len()))
    }

    async fn get_balance(&self, _address: &str) -> Result<Decimal, ChainError> {
        Ok(Decimal::ZERO)
    }

    fn validate_address(&self, address: &str) -> Result<(), ChainError> {
        match self.network {
            Network::Xrp if !address.starts_with('r') => Err(ChainError::InvalidAddress(address.to_string())),
            _ => Ok(()),
        }
    }
}

fn eth_receipt(hash: &str, block: u64, status: ReceiptStatus) -> Receipt {
    Receipt {
        tx_hash: hash.to_string(),
        status,
        block_number: Some(block),
        block_hash: Some(format!("0xblock{}", block)),
        depth: Depth::Included,
    }
}

fn deposit_config() -> Arc<PaymentsConfig> {
    let mut config = PaymentsConfig::devnet();
    config.retry = RetryPolicy::immediate(3);
    config.chains.get_mut(&Network::Eth).unwrap().required_confirmations = 3;
    Arc::new(config)
}

struct DepositPipeline {
    watcher: DepositWatcher,
    consumer: Consumer,
    confirmer: Arc<DepositConfirmer>,
    bus: Arc<dyn EventBus>,
    store: Arc<SqliteStore>,
    locks: Arc<dyn LockManager>,
    ledger: MemoryLedger,
}

/// Watcher and confirmation worker sharing one SQLite database
async fn deposit_pipeline(chain: Arc<FakeChain>) -> DepositPipeline {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let bus: Arc<dyn EventBus> = Arc::new(SqliteBus::new(store.pool(), BusSettings::default()).unwrap());
    bus.declare_queue("deposits", &[inbound_routing_key(Network::Eth)]).await.unwrap();
    let locks: Arc<dyn LockManager> = Arc::new(SqliteLockManager::new(store.pool()).unwrap());
    let alerter = Arc::new(RecordingAlerter::new());
    let ledger = MemoryLedger::new();

    let wallet = Wallet::new(
        Wallet::derivation_id("u1", Network::Eth),
        "u1".to_string(),
        Network::Eth,
        USER_ADDRESS.to_string(),
        None,
    );
    WalletStore::insert(store.as_ref(), &wallet).await.unwrap();

    let mut inbox = WebhookInbox::new();
    let watcher = DepositWatcher::new(
        Box::new(inbox.open(Network::Eth, 8)),
        store.clone(),
        store.clone(),
        bus.clone(),
        alerter.clone(),
    )
    .with_retry(RetryPolicy::immediate(3));

    let client: Arc<dyn ChainClient> = chain;
    let confirmer = Arc::new(DepositConfirmer::new(
        store.clone(),
        ChainRegistry::new().with_client(client),
        Arc::new(ledger.clone()),
        locks.clone(),
        bus.clone(),
        alerter.clone(),
        deposit_config(),
    ));
    let consumer = Consumer::new(bus.clone(), "deposits", confirmer.clone(), alerter);

    DepositPipeline {
        watcher,
        consumer,
        confirmer,
        bus,
        store,
        locks,
        ledger,
    }
}

fn transfer(external_id: &str, amount: Decimal) -> InboundTransfer {
    InboundTransfer {
        network: Network::Eth,
        external_id: external_id.to_string(),
        address: USER_ADDRESS.to_string(),
        destination_tag: None,
        amount,
    }
}

/// Deliver everything waiting on `queue`
async fn drain(bus: &dyn EventBus, consumer: &Consumer, queue: &str) -> usize {
    let mut handled = 0;
    while let Some(delivery) = bus.receive(queue).await.unwrap() {
        consumer.process(delivery).await.unwrap();
        handled += 1;
    }
    handled
}

#[tokio::test]
async fn test_deposit_is_credited_once_after_confirmations() {
    let chain = Arc::new(FakeChain::new(Network::Eth, 18, 50, dec!(0.0001)));
    chain.set_receipt(eth_receipt("abc", 45, ReceiptStatus::Success));
    let mut p = deposit_pipeline(chain).await;

    assert!(p.watcher.observe(transfer("abc", dec!(0.5))).await.unwrap());
    // The same transfer seen again is not republished
    assert!(!p.watcher.observe(transfer("abc", dec!(0.5))).await.unwrap());

    assert_eq!(drain(p.bus.as_ref(), &p.consumer, "deposits").await, 1);

    let deposit = DepositStore::get_by_external_id(p.store.as_ref(), Network::Eth, "abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deposit.status, DepositStatus::Completed);
    assert_eq!(deposit.confirmations, 5);
    assert!(deposit.id.starts_with("dep_"));

    let credits = p.ledger.entries_for(&deposit.id).await;
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].user_id, "u1");
    assert_eq!(credits[0].delta, dec!(0.5));

    // Rescans after completion leave the ledger alone
    p.confirmer.scan_once(4).await.unwrap();
    assert_eq!(p.ledger.entries().await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_detection_messages_credit_once() {
    let chain = Arc::new(FakeChain::new(Network::Eth, 18, 50, dec!(0.0001)));
    chain.set_receipt(eth_receipt("abc", 45, ReceiptStatus::Success));
    let p = deposit_pipeline(chain).await;

    let envelope = payments::bus::Envelope::wrap(
        &payments::types::DepositDetected {
            network: Network::Eth,
            external_id: "abc".to_string(),
            user_id: "u1".to_string(),
            address: USER_ADDRESS.to_string(),
            amount: dec!(0.5),
        },
        "test",
    )
    .unwrap();

    p.confirmer.handle(&envelope).await.unwrap();
    p.confirmer.handle(&envelope).await.unwrap();

    assert_eq!(p.ledger.entries().await.len(), 1);
    let counts = DepositStore::count_by_status(p.store.as_ref()).await.unwrap();
    assert_eq!(counts.values().sum::<u64>(), 1);
}

#[tokio::test]
async fn test_reverted_deposit_is_cancelled_without_credit() {
    let chain = Arc::new(FakeChain::new(Network::Eth, 18, 50, dec!(0.0001)));
    chain.set_receipt(eth_receipt("bad", 45, ReceiptStatus::Reverted));
    let mut p = deposit_pipeline(chain).await;

    p.watcher.observe(transfer("bad", dec!(2))).await.unwrap();
    drain(p.bus.as_ref(), &p.consumer, "deposits").await;

    let deposit = DepositStore::get_by_external_id(p.store.as_ref(), Network::Eth, "bad")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deposit.status, DepositStatus::Cancelled);
    assert_eq!(deposit.reason.as_deref(), Some(CancelReason::NoTransaction.code()));
    assert!(p.ledger.entries().await.is_empty());
}

#[tokio::test]
async fn test_locked_deposit_is_left_to_the_holder() {
    let chain = Arc::new(FakeChain::new(Network::Eth, 18, 50, dec!(0.0001)));
    chain.set_receipt(eth_receipt("abc", 45, ReceiptStatus::Success));
    let p = deposit_pipeline(chain.clone()).await;

    let detected = payments::types::DepositDetected {
        network: Network::Eth,
        external_id: "abc".to_string(),
        user_id: "u1".to_string(),
        address: USER_ADDRESS.to_string(),
        amount: dec!(0.5),
    };
    p.confirmer.register(&detected).await.unwrap();

    // Another worker holds the deposit while this one scans
    let confirmer = p.confirmer.clone();
    let held = with_lock(
        p.locks.as_ref(),
        DEPOSIT_CONFIRM_NAMESPACE,
        "eth:abc",
        Duration::from_secs(30),
        || async move { confirmer.process(Network::Eth, "abc").await },
    )
    .await
    .unwrap();

    assert_eq!(held, Some(None));
    assert_eq!(chain.receipt_calls.load(Ordering::SeqCst), 0);
    assert!(p.ledger.entries().await.is_empty());

    // Once released the next cycle completes it
    p.confirmer.scan_once(1).await.unwrap();
    assert_eq!(p.ledger.entries().await.len(), 1);
}

fn withdrawal_config() -> Arc<PaymentsConfig> {
    let mut config = PaymentsConfig::devnet();
    config.retry = RetryPolicy::immediate(2);
    let xrp = config.chains.get_mut(&Network::Xrp).unwrap();
    xrp.hot_wallet_address = Some(XRP_HOT.to_string());
    xrp.min_withdrawal = dec!(1);
    xrp.max_withdrawal = dec!(10000);
    xrp.fee_cap = Some(dec!(1));
    Arc::new(config)
}

#[tokio::test]
async fn test_withdrawal_request_to_finished() {
    let chain = Arc::new(FakeChain::new(Network::Xrp, 6, 0, dec!(0.000011)));
    let client: Arc<dyn ChainClient> = chain.clone();
    let chains = ChainRegistry::new().with_client(client);
    let store = MemoryStore::new();
    let ledger = MemoryLedger::strict();
    ledger.deposit_funds("u1", dec!(500)).await;
    let bus = InMemoryBus::new(BusSettings::default());
    bus.declare_queue("requests", &[WITHDRAWAL_REQUEST_ROUTING_KEY.to_string()])
        .await
        .unwrap();
    bus.declare_queue("sent", &[outbound_routing_key(Network::Xrp)]).await.unwrap();
    let alerter = Arc::new(RecordingAlerter::new());
    let locks = Arc::new(MemoryLockManager::new());
    let config = withdrawal_config();

    let dispatcher = Arc::new(WithdrawalDispatcher::new(
        Arc::new(store.clone()),
        chains.clone(),
        Arc::new(ledger.clone()),
        locks.clone(),
        Arc::new(bus.clone()),
        alerter.clone(),
        config.clone(),
    ));
    let confirmer = Arc::new(WithdrawalConfirmer::new(
        Arc::new(store.clone()),
        chains,
        Arc::new(ledger.clone()),
        locks,
        Arc::new(bus.clone()),
        alerter.clone(),
        config,
    ));
    let requests = Consumer::new(Arc::new(bus.clone()), "requests", dispatcher, alerter.clone());
    let sent = Consumer::new(Arc::new(bus.clone()), "sent", confirmer.clone(), alerter.clone());

    let request = WithdrawalRequested {
        request_id: "w-100".to_string(),
        user_id: "u1".to_string(),
        network: Network::Xrp,
        amount: dec!(120),
        destination: XRP_DEST.to_string(),
        destination_tag: Some(7),
    };
    payments::bus::publish_message(&bus, &request, "test").await.unwrap();
    assert_eq!(drain(&bus, &requests, "requests").await, 1);

    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].fee, dec!(0.000017));
    assert_eq!(broadcasts[0].destination_tag, Some(7));
    assert_eq!(broadcasts[0].source.address, XRP_HOT);
    assert_eq!(ledger.balance("u1").await, dec!(380));

    // Not validated yet: stays in flight
    assert_eq!(drain(&bus, &sent, "sent").await, 1);
    let record = WithdrawalStore::get_by_id(&store, "w-100").await.unwrap().unwrap();
    assert_eq!(record.status, WithdrawalStatus::Sending);

    chain.set_receipt(Receipt {
        tx_hash: "TX1".to_string(),
        status: ReceiptStatus::Success,
        block_number: Some(9001),
        block_hash: None,
        depth: Depth::Validated(true),
    });
    assert_eq!(confirmer.scan_once(2).await.unwrap(), 1);

    let record = WithdrawalStore::get_by_id(&store, "w-100").await.unwrap().unwrap();
    assert_eq!(record.status, WithdrawalStatus::Finished);
    assert_eq!(record.external_id.as_deref(), Some("TX1"));
    // One debit, no refund
    assert_eq!(ledger.entries().await.len(), 1);
    assert_eq!(ledger.balance("u1").await, dec!(380));
    assert!(alerter.alerts().await.is_empty());
}

#[tokio::test]
async fn test_fee_estimate_above_cap_pays_the_cap() {
    let chain = Arc::new(FakeChain::new(Network::Xrp, 6, 0, dec!(2)));
    let client: Arc<dyn ChainClient> = chain.clone();
    let store = MemoryStore::new();
    let ledger = MemoryLedger::strict();
    ledger.deposit_funds("u1", dec!(500)).await;

    let dispatcher = WithdrawalDispatcher::new(
        Arc::new(store.clone()),
        ChainRegistry::new().with_client(client),
        Arc::new(ledger.clone()),
        Arc::new(MemoryLockManager::new()),
        Arc::new(InMemoryBus::new(BusSettings::default())),
        Arc::new(RecordingAlerter::new()),
        withdrawal_config(),
    );

    let status = dispatcher
        .request(&WithdrawalRequested {
            request_id: "w-cap".to_string(),
            user_id: "u1".to_string(),
            network: Network::Xrp,
            amount: dec!(10),
            destination: XRP_DEST.to_string(),
            destination_tag: None,
        })
        .await
        .unwrap();

    assert_eq!(status, WithdrawalStatus::Sending);
    let broadcasts = chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    // 2 * 1.5 would be 3; the cap wins
    assert_eq!(broadcasts[0].fee, dec!(1));
    assert_eq!(ledger.balance("u1").await, dec!(490));
}
