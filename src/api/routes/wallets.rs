//! Deposit wallet registration.

use axum::{extract::State, http::StatusCode, Json};

use crate::api::middleware::ApiError;
use crate::api::server::SharedAppState;
use crate::common::PaymentError;
use crate::storage::StorageError;
use crate::types::{CreateWalletRequest, Wallet};

/// POST /wallets
///
/// Returns the user's existing wallet for the network when there is one.
/// Shared-address networks hand out the shared address plus a per-user tag.
pub async fn create(
    State(state): State<SharedAppState>,
    Json(request): Json<CreateWalletRequest>,
) -> Result<(StatusCode, Json<Wallet>), ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id is required"));
    }
    let network = request.network;

    if let Some(existing) = state
        .wallets
        .get_for_user(&request.user_id, network)
        .await
        .map_err(PaymentError::from)?
    {
        return Ok((StatusCode::OK, Json(existing)));
    }

    let client = state.chains.get(network).map_err(PaymentError::from)?;
    let wallet_id = Wallet::derivation_id(&request.user_id, network);
    let address = client.derive_address(&wallet_id).await.map_err(PaymentError::from)?;
    let destination_tag = network
        .uses_destination_tag()
        .then(|| Wallet::tag_for_user(&request.user_id));

    let wallet = Wallet::new(wallet_id, request.user_id.clone(), network, address, destination_tag);
    match state.wallets.insert(&wallet).await {
        Ok(()) => {}
        // Concurrent registration for the same user
        Err(StorageError::Duplicate(_)) => {
            let existing = state
                .wallets
                .get_for_user(&request.user_id, network)
                .await
                .map_err(PaymentError::from)?
                .ok_or_else(|| PaymentError::fatal("wallet vanished after duplicate insert"))?;
            return Ok((StatusCode::OK, Json(existing)));
        }
        Err(e) => return Err(PaymentError::from(e).into()),
    }

    tracing::info!(
        target: "payments::api",
        %network,
        user_id = %wallet.user_id,
        address = %wallet.address,
        tag = ?wallet.destination_tag,
        "wallet registered"
    );
    Ok((StatusCode::CREATED, Json(wallet)))
}
