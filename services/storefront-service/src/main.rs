use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storefront_service::gateway::{HttpGateway, PaymentGateway, StubGateway};
use storefront_service::store::{InMemoryOrderStore, OrderStore, PgOrderStore};
use storefront_service::{
    build_jwt_verifier_from_env, build_router, spawn_jwks_refresh, AppState, StorefrontConfig,
    SERVICE_NAME,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = StorefrontConfig::from_env()?;

    let store: Arc<dyn OrderStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPool::connect(url).await.context("connecting to DATABASE_URL")?;
            let store = PgOrderStore::new(pool);
            if config.run_migrations {
                store.run_migrations().await.context("running migrations")?;
                info!("database migrations applied");
            }
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory order store (development only)");
            Arc::new(InMemoryOrderStore::new())
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match config.gateway.clone() {
        Some(gateway_config) => {
            info!(base_url = %gateway_config.base_url, sandbox = config.sandbox, "using HTTP payment gateway");
            Arc::new(HttpGateway::new(gateway_config).map_err(|e| anyhow!("gateway client: {e}"))?)
        }
        None => {
            warn!("GATEWAY_BASE_URL not set; using stub payment gateway (development only)");
            Arc::new(StubGateway::new())
        }
    };

    let jwt_verifier = build_jwt_verifier_from_env().await?;
    spawn_jwks_refresh(jwt_verifier.clone());

    let addr = SocketAddr::new(config.host.parse().context("HOST must be an IP address")?, config.port);
    let state = AppState::new(store, gateway, jwt_verifier, config);
    let app = build_router(state);

    info!(%addr, service = SERVICE_NAME, "starting");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
