//! Payments worker
//!
//! Run modes:
//!   payments-worker                - Every worker plus the HTTP API
//!   payments-worker all            - Same as above
//!   payments-worker watcher        - Deposit watchers (and custodial webhooks)
//!   payments-worker deposits       - Deposit confirmation
//!   payments-worker withdrawals    - Withdrawal dispatch and confirmation
//!   payments-worker pooling        - Hot wallet pooling
//!   payments-worker config         - Print the configuration and exit
//!
//! Every mode serves `/health` and `/ready`. Webhook notifications are only
//! accepted by processes that run the deposit watchers.

use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use payments::alert::{self, Alerter};
use payments::api::{self, AppState};
use payments::bus::{BusSettings, Consumer, EventBus, MessageHandler, SqliteBus};
use payments::chain::{ChainRegistry, RemoteSigner};
use payments::common::{init_from_config, Health, PaymentError, PaymentsConfig};
use payments::deposit::{feeds_from_config, DepositConfirmer, DepositWatcher, WebhookInbox};
use payments::ledger::{HttpLedgerClient, LedgerService};
use payments::lock::{LockManager, SqliteLockManager};
use payments::pooling::PoolingWorker;
use payments::storage::SqliteStore;
use payments::supervisor::{supervise, RestartPolicy};
use payments::types::{
    inbound_routing_key, outbound_routing_key, WITHDRAWAL_REQUEST_ROUTING_KEY,
    WITHDRAWAL_REVIEW_ROUTING_KEY,
};
use payments::withdrawal::{WithdrawalConfirmer, WithdrawalDispatcher};

const DEPOSIT_QUEUE: &str = "payments.deposits";
const WITHDRAWAL_QUEUE: &str = "payments.withdrawals";
const OUTBOUND_QUEUE: &str = "payments.outbound";
const BUS_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Watcher,
    Deposits,
    Withdrawals,
    Pooling,
}

impl Mode {
    fn runs(self, other: Mode) -> bool {
        self == Mode::All || self == other
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let mode = match args.get(1).map(String::as_str) {
        None | Some("all") => Mode::All,
        Some("watcher") => Mode::Watcher,
        Some("deposits") => Mode::Deposits,
        Some("withdrawals") => Mode::Withdrawals,
        Some("pooling") => Mode::Pooling,
        Some("config") => {
            match PaymentsConfig::from_env() {
                Ok(config) => config.print_summary(),
                Err(e) => eprintln!("Configuration error: {}", e),
            }
            return;
        }
        Some(_) => {
            print_usage();
            return;
        }
    };

    let config = match PaymentsConfig::from_env().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = init_from_config(&config) {
        eprintln!("Failed to initialise logging: {}", e);
        std::process::exit(2);
    }

    if let Err(e) = run(mode, config).await {
        tracing::error!(target: "payments::system", error = %e, code = e.error_code(), "payments worker stopped");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Payments worker - deposit and withdrawal pipeline");
    println!();
    println!("Usage:");
    println!("  payments-worker [all]        Run every worker and the HTTP API");
    println!("  payments-worker watcher      Run the deposit watchers");
    println!("  payments-worker deposits     Run deposit confirmation");
    println!("  payments-worker withdrawals  Run withdrawal dispatch and confirmation");
    println!("  payments-worker pooling      Run hot wallet pooling");
    println!("  payments-worker config       Print configuration and exit");
    println!();
    println!("Environment Variables:");
    println!("  PAYMENTS_ENV             devnet | testnet | mainnet");
    println!("  PAYMENTS_DATABASE_PATH   SQLite database shared by all workers");
    println!("  PAYMENTS_LEDGER_URL      Wallet ledger service");
    println!("  PAYMENTS_SIGNER_URL      Key management / signing service");
    println!("  PAYMENTS_WEBHOOK_TOKEN   Shared secret for custodial webhooks");
    println!("  PAYMENTS_<NET>_*         Per-network settings (RPC, confirmations, fees)");
}

/// Shared dependencies of every worker
struct Runtime {
    config: Arc<PaymentsConfig>,
    store: Arc<SqliteStore>,
    locks: Arc<dyn LockManager>,
    bus: Arc<dyn EventBus>,
    ledger: Arc<dyn LedgerService>,
    chains: ChainRegistry,
    alerter: Arc<dyn Alerter>,
    health: Health,
    cancel: CancellationToken,
}

impl Runtime {
    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::new(self.config.supervisor_max_restarts, self.config.retry.clone())
    }

    /// Run `factory` under the supervisor inside `tasks`
    fn spawn<F, Fut>(&self, tasks: &mut JoinSet<Result<(), PaymentError>>, name: &'static str, factory: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PaymentError>> + Send + 'static,
    {
        let policy = self.restart_policy();
        let health = self.health.clone();
        let alerter = self.alerter.clone();
        let cancel = self.cancel.clone();
        tasks.spawn(async move { supervise(name, factory, policy, health, alerter, cancel).await });
    }

    /// Supervised bus consumer for `queue`
    fn spawn_consumer(
        &self,
        tasks: &mut JoinSet<Result<(), PaymentError>>,
        name: &'static str,
        queue: &'static str,
        handler: Arc<dyn MessageHandler>,
    ) {
        let bus = self.bus.clone();
        let alerter = self.alerter.clone();
        let cancel = self.cancel.clone();
        let concurrency = self.config.consumers;
        self.spawn(tasks, name, move || {
            Consumer::new(bus.clone(), queue, handler.clone(), alerter.clone())
                .with_concurrency(concurrency)
                .run(cancel.clone())
        });
    }
}

async fn run(mode: Mode, config: PaymentsConfig) -> Result<(), PaymentError> {
    tracing::info!(
        target: "payments::system",
        ?mode,
        environment = ?config.environment,
        networks = ?config.enabled_networks().collect::<Vec<_>>(),
        "starting payments worker"
    );

    let config = Arc::new(config);
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let locks: Arc<dyn LockManager> = Arc::new(SqliteLockManager::new(store.pool())?);
    let bus: Arc<dyn EventBus> = Arc::new(SqliteBus::new(
        store.pool(),
        BusSettings {
            max_attempts: config.bus_max_attempts,
            redelivery_delay: config.bus_redelivery_delay,
            ..BusSettings::default()
        },
    )?);
    let signer = Arc::new(RemoteSigner::new(&config.signer_url));
    let chains = ChainRegistry::from_config(&config, signer)?;
    let ledger: Arc<dyn LedgerService> = Arc::new(HttpLedgerClient::new(&config.ledger_url));
    let alerter = alert::from_config(config.alert_webhook.as_deref());

    let networks: Vec<_> = config.enabled_networks().collect();
    bus.declare_queue(
        DEPOSIT_QUEUE,
        &networks.iter().map(|n| inbound_routing_key(*n)).collect::<Vec<_>>(),
    )
    .await?;
    bus.declare_queue(
        WITHDRAWAL_QUEUE,
        &[
            WITHDRAWAL_REQUEST_ROUTING_KEY.to_string(),
            WITHDRAWAL_REVIEW_ROUTING_KEY.to_string(),
        ],
    )
    .await?;
    bus.declare_queue(
        OUTBOUND_QUEUE,
        &networks.iter().map(|n| outbound_routing_key(*n)).collect::<Vec<_>>(),
    )
    .await?;

    let rt = Runtime {
        config: config.clone(),
        store: store.clone(),
        locks,
        bus,
        ledger,
        chains,
        alerter,
        health: Health::new(),
        cancel: CancellationToken::new(),
    };
    let mut tasks = JoinSet::new();

    let mut inbox = WebhookInbox::new();
    if mode.runs(Mode::Watcher) {
        for feed in feeds_from_config(&config, rt.store.clone(), &mut inbox)? {
            let name = feed_worker_name(feed.network());
            let watcher = DepositWatcher::new(
                feed,
                rt.store.clone(),
                rt.store.clone(),
                rt.bus.clone(),
                rt.alerter.clone(),
            )
            .with_reconnect(config.retry.clone(), config.watcher_max_reconnects)
            .with_retry(config.retry.clone())
            .with_poll_interval(config.deposit_poll_interval);
            // Restarts resume the same watcher so its cursor survives
            let watcher = Arc::new(Mutex::new(watcher));
            let cancel = rt.cancel.clone();
            rt.spawn(&mut tasks, name, move || {
                let watcher = watcher.clone();
                let cancel = cancel.clone();
                async move {
                    let mut watcher = watcher.lock_owned().await;
                    watcher.run(cancel).await
                }
            });
        }
    }

    if mode.runs(Mode::Deposits) {
        let confirmer = Arc::new(DepositConfirmer::new(
            rt.store.clone(),
            rt.chains.clone(),
            rt.ledger.clone(),
            rt.locks.clone(),
            rt.bus.clone(),
            rt.alerter.clone(),
            config.clone(),
        ));
        rt.spawn_consumer(&mut tasks, "deposit-consumer", DEPOSIT_QUEUE, confirmer.clone());
        let cancel = rt.cancel.clone();
        rt.spawn(&mut tasks, "deposit-scan", move || {
            let confirmer = confirmer.clone();
            let cancel = cancel.clone();
            async move { confirmer.run(cancel).await }
        });
    }

    if mode.runs(Mode::Withdrawals) {
        let dispatcher = Arc::new(WithdrawalDispatcher::new(
            rt.store.clone(),
            rt.chains.clone(),
            rt.ledger.clone(),
            rt.locks.clone(),
            rt.bus.clone(),
            rt.alerter.clone(),
            config.clone(),
        ));
        rt.spawn_consumer(&mut tasks, "withdrawal-consumer", WITHDRAWAL_QUEUE, dispatcher);

        let confirmer = Arc::new(WithdrawalConfirmer::new(
            rt.store.clone(),
            rt.chains.clone(),
            rt.ledger.clone(),
            rt.locks.clone(),
            rt.bus.clone(),
            rt.alerter.clone(),
            config.clone(),
        ));
        rt.spawn_consumer(&mut tasks, "outbound-consumer", OUTBOUND_QUEUE, confirmer.clone());
        let cancel = rt.cancel.clone();
        rt.spawn(&mut tasks, "outbound-scan", move || {
            let confirmer = confirmer.clone();
            let cancel = cancel.clone();
            async move { confirmer.run(cancel).await }
        });
    }

    if mode.runs(Mode::Pooling) {
        let worker = Arc::new(PoolingWorker::new(
            rt.store.clone(),
            rt.chains.clone(),
            rt.locks.clone(),
            rt.bus.clone(),
            config.clone(),
        ));
        if !worker.networks().is_empty() {
            let cancel = rt.cancel.clone();
            rt.spawn(&mut tasks, "pooling", move || {
                let worker = worker.clone();
                let cancel = cancel.clone();
                async move { worker.run(cancel).await }
            });
        }
    }

    // Every process shares the bus tables, so each one sweeps them
    let bus = rt.bus.clone();
    let retention = config.bus_retention;
    let cancel = rt.cancel.clone();
    rt.spawn(&mut tasks, "bus-retention", move || {
        let bus = bus.clone();
        let cancel = cancel.clone();
        async move {
            payments::bus::run_retention(bus.as_ref(), retention, BUS_RETENTION_INTERVAL, cancel).await?;
            Ok(())
        }
    });

    let state = AppState::new(
        rt.health.clone(),
        rt.store.clone(),
        rt.chains.clone(),
        inbox,
        config.webhook_token.clone(),
    );
    let api_cancel = rt.cancel.clone();
    let port = config.api_port;
    tasks.spawn(async move { api::serve(state, port, api_cancel).await });

    rt.health.mark_ready();
    tracing::info!(target: "payments::system", workers = tasks.len(), "payments worker ready");

    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!(target: "payments::system", "shutdown requested, draining");
        }
        Some(joined) = tasks.join_next() => {
            // A supervised worker only returns early once it is out of restarts
            result = flatten(joined);
        }
    }

    rt.health.mark_draining();
    rt.cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            tracing::warn!(target: "payments::system", error = %e, "worker failed during shutdown");
        }
    }

    tracing::info!(target: "payments::system", "payments worker stopped");
    result
}

fn flatten(joined: Result<Result<(), PaymentError>, tokio::task::JoinError>) -> Result<(), PaymentError> {
    joined.map_err(|e| PaymentError::fatal(format!("worker task failed: {}", e)))?
}

fn feed_worker_name(network: payments::types::Network) -> &'static str {
    use payments::types::Network;
    match network {
        Network::Btc => "watcher-btc",
        Network::Ltc => "watcher-ltc",
        Network::Doge => "watcher-doge",
        Network::Eth => "watcher-eth",
        Network::Erc20 => "watcher-erc20",
        Network::Trx => "watcher-trx",
        Network::Xrp => "watcher-xrp",
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "payments::system", error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(target: "payments::system", error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
