pub mod admin_handlers;
pub mod app;
pub mod cancellation;
pub mod checkout;
pub mod config;
pub mod gateway;
pub mod model;
pub mod order_handlers;
pub mod payment_handlers;
pub mod refunds;
pub mod store;
pub mod webhook;

#[cfg(test)]
mod test_support;

pub use app::{build_jwt_verifier_from_env, build_router, spawn_jwks_refresh, AppState, SERVICE_NAME};
pub use config::StorefrontConfig;
