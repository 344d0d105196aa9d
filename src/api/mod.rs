//! HTTP surface: probes, provider webhooks and wallet registration.

pub mod middleware;
pub mod routes;
pub mod server;

pub use middleware::{ApiError, RateLimiter};
pub use server::{create_router, serve, AppState, SharedAppState};
