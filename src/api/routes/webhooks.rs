//! Custodial provider webhooks.
//!
//! Providers for BTC-like networks push each incoming transfer here. The
//! notification is handed to the network's deposit watcher, which owns
//! deduplication and wallet matching.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::middleware::{check_webhook_token, extract_client_ip, ApiError};
use crate::api::server::SharedAppState;
use crate::common::log_security_event;
use crate::deposit::InboundTransfer;
use crate::types::Network;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    pub hash: String,
    pub address: String,
    pub amount: Decimal,
    #[serde(default)]
    pub destination_tag: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub accepted: bool,
}

/// POST /webhooks/:network
pub async fn receive(
    State(state): State<SharedAppState>,
    Path(network): Path<String>,
    headers: HeaderMap,
    Json(body): Json<WebhookNotification>,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    if let Err(e) = check_webhook_token(&headers, state.webhook_token.as_deref()) {
        log_security_event(
            "webhook_rejected",
            false,
            serde_json::json!({
                "network": network,
                "client": extract_client_ip(&headers),
            }),
            None,
        );
        return Err(e);
    }

    let network: Network = network
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown network {}", network)))?;
    if !state.inbox.accepts(network) {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("no webhook feed for {}", network),
        ));
    }
    if body.hash.is_empty() || body.address.is_empty() {
        return Err(ApiError::bad_request("hash and address are required"));
    }
    if body.amount <= Decimal::ZERO {
        return Err(ApiError::bad_request("amount must be positive"));
    }

    tracing::debug!(target: "payments::api", %network, hash = %body.hash, "webhook notification");
    state
        .inbox
        .deliver(InboundTransfer {
            network,
            external_id: body.hash,
            address: body.address,
            destination_tag: body.destination_tag,
            amount: body.amount,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(WebhookAck { accepted: true })))
}
