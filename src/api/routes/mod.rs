//! API Routes
//!
//! - health: liveness and readiness probes
//! - webhooks: custodial provider deposit notifications
//! - wallets: deposit wallet registration

pub mod health;
pub mod wallets;
pub mod webhooks;
