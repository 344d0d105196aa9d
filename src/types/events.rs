//! Bus Messages
//!
//! Typed bodies for every routing key the pipeline publishes or consumes.
//! Routing keys take the form `payments.<event>` or
//! `payments.<direction><Chain><Kind>`.

use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{Network, PoolingRecord, WithdrawalRequested, WithdrawalReview};

pub const DEPOSIT_ROUTING_KEY: &str = "payments.deposit";
pub const WITHDRAWAL_REQUEST_ROUTING_KEY: &str = "payments.withdrawalRequest";
pub const WITHDRAWAL_REVIEW_ROUTING_KEY: &str = "payments.withdrawalReview";

pub fn inbound_routing_key(network: Network) -> String {
    format!("payments.inbound{}Transaction", network.routing_label())
}

pub fn outbound_routing_key(network: Network) -> String {
    format!("payments.outbound{}Transaction", network.routing_label())
}

pub fn outbound_confirmation_routing_key(network: Network) -> String {
    format!("payments.outbound{}Confirmation", network.routing_label())
}

pub fn pooling_routing_key(network: Network) -> String {
    format!("payments.pooling{}", network.routing_label())
}

/// A typed message body that knows where it is routed
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Value of the envelope's `type` field
    const MESSAGE_TYPE: &'static str;

    fn routing_key(&self) -> String;

    /// Broker-level deduplication key, if the message has a natural one
    fn dedup_key(&self) -> Option<String> {
        None
    }
}

/// Watcher observed an inbound transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositDetected {
    pub network: Network,
    pub external_id: String,
    pub user_id: String,
    pub address: String,
    pub amount: Decimal,
}

impl BusMessage for DepositDetected {
    const MESSAGE_TYPE: &'static str = "DepositDetected";

    fn routing_key(&self) -> String {
        inbound_routing_key(self.network)
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("{}:{}", self.network, self.external_id))
    }
}

/// A deposit reached a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositSettled {
    pub deposit_id: String,
    pub network: Network,
    pub external_id: String,
    pub user_id: String,
    pub amount: Decimal,
    /// `completed` or `cancelled`
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BusMessage for DepositSettled {
    const MESSAGE_TYPE: &'static str = "DepositSettled";

    fn routing_key(&self) -> String {
        DEPOSIT_ROUTING_KEY.to_string()
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("settled:{}", self.deposit_id))
    }
}

impl BusMessage for WithdrawalRequested {
    const MESSAGE_TYPE: &'static str = "WithdrawalRequested";

    fn routing_key(&self) -> String {
        WITHDRAWAL_REQUEST_ROUTING_KEY.to_string()
    }

    fn dedup_key(&self) -> Option<String> {
        Some(self.request_id.clone())
    }
}

impl BusMessage for WithdrawalReview {
    const MESSAGE_TYPE: &'static str = "WithdrawalReview";

    fn routing_key(&self) -> String {
        WITHDRAWAL_REVIEW_ROUTING_KEY.to_string()
    }
}

/// A withdrawal was signed and broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSent {
    pub withdrawal_id: String,
    pub network: Network,
    pub external_id: String,
    pub amount: Decimal,
    pub fee: Decimal,
}

impl BusMessage for OutboundSent {
    const MESSAGE_TYPE: &'static str = "OutboundSent";

    fn routing_key(&self) -> String {
        outbound_routing_key(self.network)
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("sent:{}", self.withdrawal_id))
    }
}

/// A broadcast withdrawal reached finality (or reverted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfirmed {
    pub withdrawal_id: String,
    pub network: Network,
    pub external_id: String,
    pub confirmations: u32,
    /// `finished` or `failed`
    pub status: String,
}

impl BusMessage for OutboundConfirmed {
    const MESSAGE_TYPE: &'static str = "OutboundConfirmation";

    fn routing_key(&self) -> String {
        outbound_confirmation_routing_key(self.network)
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("confirmed:{}", self.withdrawal_id))
    }
}

impl BusMessage for PoolingRecord {
    const MESSAGE_TYPE: &'static str = "PoolingCompleted";

    fn routing_key(&self) -> String {
        pooling_routing_key(self.network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_routing_keys() {
        assert_eq!(inbound_routing_key(Network::Trx), "payments.inboundTronTransaction");
        assert_eq!(
            outbound_confirmation_routing_key(Network::Xrp),
            "payments.outboundRippleConfirmation"
        );
        assert_eq!(outbound_routing_key(Network::Erc20), "payments.outboundErc20Transaction");
        assert_eq!(pooling_routing_key(Network::Eth), "payments.poolingEthereum");
    }

    #[test]
    fn test_deposit_detected_dedup() {
        let msg = DepositDetected {
            network: Network::Eth,
            external_id: "abc".to_string(),
            user_id: "u1".to_string(),
            address: "0xaddr".to_string(),
            amount: dec!(0.5),
        };
        assert_eq!(msg.dedup_key().as_deref(), Some("eth:abc"));
        assert_eq!(msg.routing_key(), "payments.inboundEthereumTransaction");

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["externalId"], "abc");
    }
}
