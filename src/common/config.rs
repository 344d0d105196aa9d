//! Environment-based Configuration for the Payments Pipeline
//!
//! All endpoints and secrets come from environment variables (optionally
//! loaded from a `.env` file by the binary).
//!
//! # Global Variables
//! - `PAYMENTS_ENV` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `PAYMENTS_DATABASE` - SQLite path (default: "payments.db")
//! - `PAYMENTS_API_PORT` - HTTP port (default: 8080)
//! - `PAYMENTS_LOG_LEVEL` - trace, debug, info, warn, error
//! - `PAYMENTS_LEDGER_URL` - Ledger service base URL
//! - `PAYMENTS_SIGNER_URL` - Signer service base URL
//! - `PAYMENTS_ALERT_WEBHOOK` - Operator alert webhook (optional)
//! - `PAYMENTS_WEBHOOK_TOKEN` - Shared token for inbound provider webhooks
//! - `PAYMENTS_CONSUMERS` - Parallel consumer tasks per queue
//! - `PAYMENTS_BUS_MAX_ATTEMPTS` - Deliveries before dead-lettering
//! - `PAYMENTS_BUS_RETENTION_SECS` - Age at which settled bus messages are purged
//! - `PAYMENTS_WITHDRAWAL_STUCK_SECS` - Age at which an unconfirmed broadcast is flagged
//!
//! # Per-network Variables
//! `PAYMENTS_<NET>_*` where `<NET>` is BTC, LTC, DOGE, ETH, ERC20, TRX or XRP:
//! `ENABLED`, `RPC_URL`, `API_KEY`, `WALLET_ID`, `HOT_WALLET`,
//! `CONFIRMATIONS`, `FEE_MULTIPLIER`, `FEE_CAP`, `MIN_WITHDRAWAL`,
//! `MAX_WITHDRAWAL`, `REVIEW_THRESHOLD`, `TOKEN_CONTRACT`, `TOKEN_DECIMALS`,
//! `POOLING`, `POOLING_MIN_BALANCE`.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use super::retry::RetryPolicy;
use crate::types::{FinalityModel, Network};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("network {0} is not enabled")]
    NetworkDisabled(Network),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "production" => Ok(Environment::Mainnet),
            "testnet" | "test" | "staging" => Ok(Environment::Testnet),
            "devnet" | "dev" | "local" => Ok(Environment::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "PAYMENTS_ENV".to_string(),
                format!("unknown environment: {}", s),
            )),
        }
    }
}

impl Environment {
    /// Default node/provider endpoint used on devnet
    pub fn default_rpc(&self, network: Network) -> &'static str {
        match network {
            Network::Btc | Network::Ltc | Network::Doge => "http://localhost:3080/api/v2",
            Network::Eth | Network::Erc20 => "http://localhost:8545",
            Network::Trx => "https://api.shasta.trongrid.io",
            Network::Xrp => "https://s.altnet.rippletest.net:51234",
        }
    }
}

/// Settings for one network
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network: Network,
    pub enabled: bool,
    pub rpc_url: String,
    pub api_key: Option<String>,
    /// Custodial provider wallet id (BTC/LTC/DOGE) or shared XRP account
    pub wallet_id: Option<String>,
    /// Pool that withdrawals are paid from and sweeps are paid into
    pub hot_wallet_address: Option<String>,
    pub required_confirmations: u32,
    pub fee_multiplier: Decimal,
    pub fee_cap: Option<Decimal>,
    pub min_withdrawal: Decimal,
    pub max_withdrawal: Decimal,
    /// Withdrawals at or above this amount are held for review
    pub review_threshold: Option<Decimal>,
    pub token_contract: Option<String>,
    pub token_decimals: u32,
    pub pooling_enabled: bool,
    pub pooling_min_balance: Decimal,
}

impl ChainConfig {
    /// Built-in defaults for a network
    pub fn defaults(network: Network, environment: Environment) -> Self {
        Self {
            network,
            // ERC-20 needs a token contract before it can run
            enabled: environment == Environment::Devnet && network != Network::Erc20,
            rpc_url: environment.default_rpc(network).to_string(),
            api_key: None,
            wallet_id: None,
            hot_wallet_address: None,
            required_confirmations: network.default_required_confirmations(),
            fee_multiplier: Decimal::new(15, 1),
            fee_cap: None,
            min_withdrawal: Decimal::ZERO,
            max_withdrawal: Decimal::MAX,
            review_threshold: None,
            token_contract: None,
            token_decimals: network.native_decimals(),
            pooling_enabled: false,
            pooling_min_balance: Decimal::ZERO,
        }
    }

    /// Smallest-unit precision for amounts on this network
    pub fn decimals(&self) -> u32 {
        self.token_decimals
    }

    fn from_env(network: Network, environment: Environment) -> Result<Self, ConfigError> {
        let mut cfg = Self::defaults(network, environment);
        let prefix = format!("PAYMENTS_{}_", network.as_str().to_uppercase());
        let var = |suffix: &str| format!("{}{}", prefix, suffix);

        cfg.enabled = env_parse(&var("ENABLED"), cfg.enabled)?;
        if !cfg.enabled {
            return Ok(cfg);
        }

        cfg.rpc_url = get_required_or_devnet_default(
            &var("RPC_URL"),
            environment.default_rpc(network),
            environment,
        )?;
        cfg.api_key = env::var(var("API_KEY")).ok();
        cfg.wallet_id = env::var(var("WALLET_ID")).ok();
        cfg.hot_wallet_address = env::var(var("HOT_WALLET")).ok();
        cfg.required_confirmations = env_parse(&var("CONFIRMATIONS"), cfg.required_confirmations)?;
        cfg.fee_multiplier = env_parse(&var("FEE_MULTIPLIER"), cfg.fee_multiplier)?;
        cfg.fee_cap = env_parse_opt(&var("FEE_CAP"))?;
        cfg.min_withdrawal = env_parse(&var("MIN_WITHDRAWAL"), cfg.min_withdrawal)?;
        cfg.max_withdrawal = env_parse(&var("MAX_WITHDRAWAL"), cfg.max_withdrawal)?;
        cfg.review_threshold = env_parse_opt(&var("REVIEW_THRESHOLD"))?;
        cfg.token_contract = env::var(var("TOKEN_CONTRACT")).ok();
        cfg.token_decimals = env_parse(&var("TOKEN_DECIMALS"), cfg.token_decimals)?;
        cfg.pooling_enabled = env_parse(&var("POOLING"), network.supports_pooling())?;
        cfg.pooling_min_balance = env_parse(&var("POOLING_MIN_BALANCE"), cfg.pooling_min_balance)?;

        if network.is_custodial() && cfg.wallet_id.is_none() && environment != Environment::Devnet {
            return Err(ConfigError::MissingEnvVar(var("WALLET_ID")));
        }

        Ok(cfg)
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = |field: &str| format!("PAYMENTS_{}_{}", self.network.as_str().to_uppercase(), field);

        if self.fee_multiplier < Decimal::ONE {
            return Err(ConfigError::InvalidValue(
                name("FEE_MULTIPLIER"),
                "must be at least 1".to_string(),
            ));
        }
        if self.min_withdrawal > self.max_withdrawal {
            return Err(ConfigError::InvalidValue(
                name("MIN_WITHDRAWAL"),
                "exceeds MAX_WITHDRAWAL".to_string(),
            ));
        }
        if self.required_confirmations == 0 {
            return Err(ConfigError::InvalidValue(
                name("CONFIRMATIONS"),
                "must be at least 1".to_string(),
            ));
        }
        // A validated ledger only ever counts as one confirmation
        if self.network.finality_model() == FinalityModel::LedgerValidated && self.required_confirmations != 1 {
            return Err(ConfigError::InvalidValue(
                name("CONFIRMATIONS"),
                format!("{} finality is binary, must be 1", self.network),
            ));
        }
        if self.network == Network::Erc20 && self.enabled && self.token_contract.is_none() {
            return Err(ConfigError::MissingEnvVar(name("TOKEN_CONTRACT")));
        }
        if self.pooling_enabled && !self.network.supports_pooling() {
            return Err(ConfigError::InvalidValue(
                name("POOLING"),
                format!("pooling not supported on {}", self.network),
            ));
        }
        Ok(())
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub environment: Environment,
    pub database_path: String,
    pub api_port: u16,
    pub log_level: String,
    pub ledger_url: String,
    pub signer_url: String,
    pub alert_webhook: Option<String>,
    pub webhook_token: Option<String>,

    pub deposit_poll_interval: Duration,
    pub withdrawal_poll_interval: Duration,
    pub pooling_interval: Duration,
    pub deposit_lock_ttl: Duration,
    pub withdraw_lock_ttl: Duration,
    pub pooling_lock_ttl: Duration,
    /// A `Sending` withdrawal with no receipt for this long is flagged
    pub withdrawal_stuck_after: Duration,

    /// Backoff for RPC and ledger calls inside one handler invocation
    pub retry: RetryPolicy,
    /// Watcher reconnect attempts before alerting
    pub watcher_max_reconnects: u32,
    pub bus_max_attempts: u32,
    pub bus_redelivery_delay: Duration,
    /// Settled bus messages older than this are purged
    pub bus_retention: Duration,
    pub consumers: usize,
    /// Restarts a supervised worker may use before it is marked unavailable
    pub supervisor_max_restarts: u32,

    pub chains: BTreeMap<Network, ChainConfig>,
}

impl PaymentsConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment: Environment = env::var("PAYMENTS_ENV")
            .unwrap_or_else(|_| "devnet".to_string())
            .parse()?;

        let ledger_url = get_required_or_devnet_default(
            "PAYMENTS_LEDGER_URL",
            "http://localhost:4000",
            environment,
        )?;
        let signer_url = get_required_or_devnet_default(
            "PAYMENTS_SIGNER_URL",
            "http://localhost:4100",
            environment,
        )?;

        let mut chains = BTreeMap::new();
        for network in Network::ALL {
            let chain = ChainConfig::from_env(network, environment)?;
            chains.insert(network, chain);
        }

        let config = Self {
            environment,
            database_path: env::var("PAYMENTS_DATABASE").unwrap_or_else(|_| "payments.db".to_string()),
            api_port: env_parse("PAYMENTS_API_PORT", 8080)?,
            log_level: env::var("PAYMENTS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            ledger_url,
            signer_url,
            alert_webhook: env::var("PAYMENTS_ALERT_WEBHOOK").ok(),
            webhook_token: env::var("PAYMENTS_WEBHOOK_TOKEN").ok(),
            deposit_poll_interval: secs("PAYMENTS_DEPOSIT_POLL_SECS", 15)?,
            withdrawal_poll_interval: secs("PAYMENTS_WITHDRAWAL_POLL_SECS", 30)?,
            pooling_interval: secs("PAYMENTS_POOLING_INTERVAL_SECS", 3600)?,
            deposit_lock_ttl: secs("PAYMENTS_DEPOSIT_LOCK_TTL_SECS", 60)?,
            withdraw_lock_ttl: secs("PAYMENTS_WITHDRAW_LOCK_TTL_SECS", 120)?,
            pooling_lock_ttl: secs("PAYMENTS_POOLING_LOCK_TTL_SECS", 300)?,
            withdrawal_stuck_after: secs("PAYMENTS_WITHDRAWAL_STUCK_SECS", 6 * 3600)?,
            retry: RetryPolicy {
                max_attempts: env_parse("PAYMENTS_RETRY_MAX_ATTEMPTS", 5)?,
                initial_interval: Duration::from_millis(env_parse("PAYMENTS_RETRY_INITIAL_MS", 500)?),
                max_interval: Duration::from_millis(env_parse("PAYMENTS_RETRY_MAX_MS", 30_000)?),
                multiplier: 2.0,
            },
            watcher_max_reconnects: env_parse("PAYMENTS_WATCHER_MAX_RECONNECTS", 10)?,
            bus_max_attempts: env_parse("PAYMENTS_BUS_MAX_ATTEMPTS", 10)?,
            bus_redelivery_delay: Duration::from_millis(env_parse("PAYMENTS_BUS_REDELIVERY_MS", 5_000)?),
            bus_retention: secs("PAYMENTS_BUS_RETENTION_SECS", 7 * 24 * 3600)?,
            consumers: env_parse("PAYMENTS_CONSUMERS", 4)?,
            supervisor_max_restarts: env_parse("PAYMENTS_SUPERVISOR_MAX_RESTARTS", 5)?,
            chains,
        };

        config.validate()?;
        Ok(config)
    }

    /// Config for local runs and tests: devnet defaults without touching the environment
    pub fn devnet() -> Self {
        let environment = Environment::Devnet;
        let chains = Network::ALL
            .into_iter()
            .map(|n| (n, ChainConfig::defaults(n, environment)))
            .collect();

        Self {
            environment,
            database_path: ":memory:".to_string(),
            api_port: 8080,
            log_level: "debug".to_string(),
            ledger_url: "http://localhost:4000".to_string(),
            signer_url: "http://localhost:4100".to_string(),
            alert_webhook: None,
            webhook_token: None,
            deposit_poll_interval: Duration::from_secs(15),
            withdrawal_poll_interval: Duration::from_secs(30),
            pooling_interval: Duration::from_secs(3600),
            deposit_lock_ttl: Duration::from_secs(60),
            withdraw_lock_ttl: Duration::from_secs(120),
            pooling_lock_ttl: Duration::from_secs(300),
            withdrawal_stuck_after: Duration::from_secs(6 * 3600),
            retry: RetryPolicy::default(),
            watcher_max_reconnects: 10,
            bus_max_attempts: 10,
            bus_redelivery_delay: Duration::from_secs(5),
            bus_retention: Duration::from_secs(7 * 24 * 3600),
            consumers: 4,
            supervisor_max_restarts: 5,
            chains,
        }
    }

    /// Settings for an enabled network
    pub fn chain(&self, network: Network) -> Result<&ChainConfig, ConfigError> {
        self.chains
            .get(&network)
            .filter(|c| c.enabled)
            .ok_or(ConfigError::NetworkDisabled(network))
    }

    pub fn enabled_networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.chains.values().filter(|c| c.enabled).map(|c| c.network)
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        for chain in self.chains.values().filter(|c| c.enabled) {
            chain.validate()?;
        }
        if self.consumers == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENTS_CONSUMERS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.bus_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENTS_BUS_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.environment == Environment::Mainnet && self.webhook_token.is_none() {
            return Err(ConfigError::MissingEnvVar("PAYMENTS_WEBHOOK_TOKEN".to_string()));
        }
        Ok(())
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Payments Configuration ===");
        println!("Environment: {:?}", self.environment);
        println!("Database: {}", self.database_path);
        println!("Ledger: {}", self.ledger_url);
        println!("Signer: {}", self.signer_url);
        println!("Alerts: {}", if self.alert_webhook.is_some() { "webhook" } else { "log only" });
        for chain in self.chains.values().filter(|c| c.enabled) {
            println!(
                "  {:<6} confirmations={} fee_multiplier={} pooling={}",
                chain.network, chain.required_confirmations, chain.fee_multiplier, chain.pooling_enabled
            );
        }
        println!("Log Level: {}", self.log_level);
        println!("==============================");
    }
}

/// Get required env var, or use default for devnet only
fn get_required_or_devnet_default(
    var_name: &str,
    devnet_default: &str,
    environment: Environment,
) -> Result<String, ConfigError> {
    match env::var(var_name) {
        Ok(value) => Ok(value),
        Err(_) if environment == Environment::Devnet => Ok(devnet_default.to_string()),
        Err(_) => Err(ConfigError::MissingEnvVar(var_name.to_string())),
    }
}

fn env_parse<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    Ok(env_parse_opt(var_name)?.unwrap_or(default))
}

fn env_parse_opt<T: FromStr>(var_name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var_name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("cannot parse {:?}", raw))
        }),
        Err(_) => Ok(None),
    }
}

fn secs(var_name: &str, default: u64) -> Result<Duration, ConfigError> {
    env_parse(var_name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_environment_parsing() {
        assert!(matches!("mainnet".parse::<Environment>(), Ok(Environment::Mainnet)));
        assert!(matches!("staging".parse::<Environment>(), Ok(Environment::Testnet)));
        assert!(matches!("dev".parse::<Environment>(), Ok(Environment::Devnet)));
        assert!("invalid".parse::<Environment>().is_err());
    }

    #[test]
    fn test_chain_defaults() {
        let xrp = ChainConfig::defaults(Network::Xrp, Environment::Devnet);
        assert_eq!(xrp.fee_multiplier, dec!(1.5));
        assert_eq!(xrp.required_confirmations, 1);
        assert!(xrp.enabled);

        let eth = ChainConfig::defaults(Network::Eth, Environment::Mainnet);
        assert!(!eth.enabled);
        assert_eq!(eth.decimals(), 18);
    }

    #[test]
    fn test_chain_validation() {
        let mut cfg = ChainConfig::defaults(Network::Eth, Environment::Devnet);
        assert!(cfg.validate().is_ok());

        cfg.min_withdrawal = dec!(10);
        cfg.max_withdrawal = dec!(1);
        assert!(cfg.validate().is_err());

        let mut xrp = ChainConfig::defaults(Network::Xrp, Environment::Devnet);
        xrp.pooling_enabled = true;
        assert!(xrp.validate().is_err());

        let mut erc20 = ChainConfig::defaults(Network::Erc20, Environment::Devnet);
        assert!(!erc20.enabled);
        erc20.enabled = true;
        assert!(matches!(erc20.validate(), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_ledger_validated_networks_need_exactly_one_confirmation() {
        let mut xrp = ChainConfig::defaults(Network::Xrp, Environment::Devnet);
        assert!(xrp.validate().is_ok());

        xrp.required_confirmations = 3;
        match xrp.validate() {
            Err(ConfigError::InvalidValue(var, _)) => assert_eq!(var, "PAYMENTS_XRP_CONFIRMATIONS"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }

        // Depth-based networks accept any positive count
        let mut eth = ChainConfig::defaults(Network::Eth, Environment::Devnet);
        eth.required_confirmations = 30;
        assert!(eth.validate().is_ok());

        let mut cfg = PaymentsConfig::devnet();
        assert!(cfg.validate().is_ok());
        cfg.chains.get_mut(&Network::Xrp).unwrap().required_confirmations = 2;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(var, _)) if var == "PAYMENTS_XRP_CONFIRMATIONS"));
    }

    #[test]
    fn test_devnet_config_lookup() {
        let cfg = PaymentsConfig::devnet();
        assert!(cfg.chain(Network::Eth).is_ok());
        assert!(cfg.chain(Network::Erc20).is_err());
        assert_eq!(cfg.enabled_networks().count(), Network::ALL.len() - 1);
    }
}
