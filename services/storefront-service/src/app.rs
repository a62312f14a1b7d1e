use std::env;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRef, State};
use axum::http::{header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE}, HeaderName, HeaderValue, Method, StatusCode};
use axum::{middleware, routing::{get, patch, post}, Router};
use tokio::time::{interval, MissedTickBehavior};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use common_auth::{JwtConfig, JwtVerifier};
use common_http_errors::{error_metrics_registry, http_error_metrics_layer};
use common_observability::ReconciliationMetrics;

use crate::admin_handlers::{admin_cancel_order, admin_list_orders, admin_refund_order, admin_update_status};
use crate::config::StorefrontConfig;
use crate::gateway::PaymentGateway;
use crate::order_handlers::{cancel_order, create_order, get_order, list_orders};
use crate::payment_handlers::create_payment_order;
use crate::store::OrderStore;
use crate::webhook::{payment_webhook, verify_webhook};

pub const SERVICE_NAME: &str = "storefront-service";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OrderStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub jwt_verifier: Arc<JwtVerifier>,
    pub config: Arc<StorefrontConfig>,
    pub metrics: Arc<ReconciliationMetrics>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        jwt_verifier: Arc<JwtVerifier>,
        config: StorefrontConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            jwt_verifier,
            config: Arc::new(config),
            metrics: Arc::new(ReconciliationMetrics::new()),
        }
    }
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_verifier.clone()
    }
}

pub async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics.render(&[error_metrics_registry()]) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}")),
    }
}

pub async fn build_jwt_verifier_from_env() -> anyhow::Result<Arc<JwtVerifier>> {
    let config = JwtConfig::from_env().map_err(anyhow::Error::from)?;
    let mut builder = JwtVerifier::builder(config);
    let mut has_key_source = false;
    if let Ok(secret) = env::var("JWT_HS256_SECRET") {
        info!("Configuring shared-secret (HS256) verification");
        builder = builder.with_hmac_secret(secret.as_bytes());
        has_key_source = true;
    }
    if let Ok(url) = env::var("JWT_JWKS_URL") {
        info!(jwks_url = %url, "Configuring JWKS fetcher");
        builder = builder.with_jwks_url(url);
        has_key_source = true;
    }
    if let Ok(pem) = env::var("JWT_DEV_PUBLIC_KEY_PEM") {
        warn!("Using JWT_DEV_PUBLIC_KEY_PEM for verification; do not enable in production");
        builder = builder
            .with_rsa_pem("local-dev", pem.as_bytes())
            .map_err(anyhow::Error::from)?;
        has_key_source = true;
    }
    if !has_key_source {
        anyhow::bail!("one of JWT_HS256_SECRET, JWT_JWKS_URL or JWT_DEV_PUBLIC_KEY_PEM must be set");
    }

    let verifier = builder.build().await.map_err(anyhow::Error::from)?;
    info!("JWT verifier initialised");
    Ok(Arc::new(verifier))
}

pub fn spawn_jwks_refresh(verifier: Arc<JwtVerifier>) {
    let Some(fetcher) = verifier.jwks_fetcher() else {
        return;
    };
    let refresh_secs = env::var("JWKS_REFRESH_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(300)
        .max(60);
    let url = fetcher.url().to_owned();
    let handle = verifier.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(refresh_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match handle.refresh_jwks().await {
                Ok(count) => debug!(count, jwks_url = %url, "Refreshed JWKS keys"),
                Err(err) => warn!(error = %err, jwks_url = %url, "Failed to refresh JWKS keys"),
            }
        }
    });
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state
                .config
                .cors_allowed_origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE, AUTHORIZATION, HeaderName::from_static("x-signature")]);

    let webhooks = Router::new()
        .route("/webhooks/payment", post(payment_webhook))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_webhook));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/payments/orders", post(create_payment_order))
        .route("/admin/orders", get(admin_list_orders))
        .route("/admin/orders/:id/status", patch(admin_update_status))
        .route("/admin/orders/:id/cancel", post(admin_cancel_order))
        .route("/admin/orders/:id/refunds", post(admin_refund_order))
        .merge(webhooks)
        .layer(middleware::from_fn(http_error_metrics_layer(SERVICE_NAME)))
        .layer(cors)
        .with_state(state)
}
