//! API Server
//!
//! Application state, router assembly and the serving loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::middleware::{rate_limit_middleware, security_headers_middleware, RateLimitConfig, RateLimiter};
use super::routes::{health, wallets, webhooks};
use crate::chain::ChainRegistry;
use crate::common::{Health, PaymentError};
use crate::deposit::WebhookInbox;
use crate::storage::WalletStore;

/// Shared state for every handler
pub struct AppState {
    pub health: Health,
    pub wallets: Arc<dyn WalletStore>,
    pub chains: ChainRegistry,
    /// Hands webhook notifications to the deposit watchers
    pub inbox: WebhookInbox,
    pub webhook_token: Option<String>,
    pub limiter: Arc<RateLimiter>,
}

pub type SharedAppState = Arc<AppState>;

impl AppState {
    pub fn new(
        health: Health,
        wallets: Arc<dyn WalletStore>,
        chains: ChainRegistry,
        inbox: WebhookInbox,
        webhook_token: Option<String>,
    ) -> SharedAppState {
        Arc::new(Self {
            health,
            wallets,
            chains,
            inbox,
            webhook_token,
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
        })
    }
}

pub fn create_router(state: SharedAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Only provider webhooks are rate limited
    let webhook_routes = Router::new()
        .route("/webhooks/:network", post(webhooks::receive))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/wallets", post(wallets::create))
        .merge(webhook_routes)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `cancel` fires, then finish in-flight requests
pub async fn serve(state: SharedAppState, port: u16, cancel: CancellationToken) -> Result<(), PaymentError> {
    let limiter = state.limiter.clone();
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "payments::api", %addr, "HTTP API listening");

    // Forget idle rate-limit clients
    let cleanup_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = cleanup_cancel.cancelled() => break,
                _ = ticker.tick() => limiter.cleanup().await,
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!(target: "payments::api", "HTTP API stopped");
    Ok(())
}
