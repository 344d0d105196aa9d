//! Network → client lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::signer::Signer;
use super::{ChainClient, ChainError, CustodialClient, EvmClient, RippleClient, TronClient};
use crate::common::{ChainConfig, ConfigError, Environment, PaymentsConfig};
use crate::types::Network;

#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: BTreeMap<Network, Arc<dyn ChainClient>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn insert(&mut self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.network(), client);
    }

    pub fn get(&self, network: Network) -> Result<Arc<dyn ChainClient>, ChainError> {
        self.clients
            .get(&network)
            .cloned()
            .ok_or_else(|| ChainError::Unsupported(format!("no client for {}", network)))
    }

    pub fn networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.clients.keys().copied()
    }

    /// Build a client for every enabled network
    pub fn from_config(config: &PaymentsConfig, signer: Arc<dyn Signer>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for network in config.enabled_networks() {
            let chain = config.chain(network)?;
            registry.insert(build_client(chain, config.environment, signer.clone())?);
        }
        Ok(registry)
    }
}

fn build_client(
    chain: &ChainConfig,
    environment: Environment,
    signer: Arc<dyn Signer>,
) -> Result<Arc<dyn ChainClient>, ConfigError> {
    let client: Arc<dyn ChainClient> = match chain.network {
        Network::Btc | Network::Ltc | Network::Doge => {
            let coin = match environment {
                Environment::Mainnet => chain.network.as_str().to_string(),
                _ => format!("t{}", chain.network.as_str()),
            };
            let wallet_id = chain
                .wallet_id
                .clone()
                .unwrap_or_else(|| format!("{}-devnet", chain.network));
            Arc::new(CustodialClient::new(
                chain.network,
                &chain.rpc_url,
                chain.api_key.as_deref(),
                &coin,
                &wallet_id,
            ))
        }
        Network::Eth => Arc::new(EvmClient::new(&chain.rpc_url, signer)),
        Network::Erc20 => {
            let contract = chain.token_contract.as_deref().ok_or_else(|| {
                ConfigError::MissingEnvVar("PAYMENTS_ERC20_TOKEN_CONTRACT".to_string())
            })?;
            Arc::new(EvmClient::erc20(&chain.rpc_url, signer, contract, chain.token_decimals))
        }
        Network::Trx => Arc::new(TronClient::new(&chain.rpc_url, chain.api_key.as_deref(), signer)),
        Network::Xrp => Arc::new(RippleClient::new(
            &chain.rpc_url,
            signer,
            chain.hot_wallet_address.clone(),
        )),
    };
    Ok(client)
}
