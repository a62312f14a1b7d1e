use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use common_crypto::WebhookSecret;

use crate::gateway::{HttpGatewayConfig, RefundMode, DEFAULT_REFUND_STRATEGIES};

pub const DEFAULT_WEBHOOK_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CANCELLATION_WINDOW_MINUTES: i64 = 6 * 60;

#[derive(Clone)]
pub struct StorefrontConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub run_migrations: bool,
    pub webhook_secret: WebhookSecret,
    pub webhook_max_body_bytes: usize,
    pub gateway: Option<HttpGatewayConfig>,
    /// Sandbox accounts reject some refunds; cancellation reports those as pending.
    pub sandbox: bool,
    pub currency: String,
    pub refund_strategies: Vec<RefundMode>,
    pub cancellation_window: chrono::Duration,
    pub cors_allowed_origins: Vec<String>,
}

impl StorefrontConfig {
    /// Defaults for everything except the webhook secret.
    pub fn new(webhook_secret: WebhookSecret) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            database_url: None,
            run_migrations: false,
            webhook_secret,
            webhook_max_body_bytes: DEFAULT_WEBHOOK_MAX_BODY_BYTES,
            gateway: None,
            sandbox: false,
            currency: "INR".to_string(),
            refund_strategies: DEFAULT_REFUND_STRATEGIES.to_vec(),
            cancellation_window: chrono::Duration::minutes(DEFAULT_CANCELLATION_WINDOW_MINUTES),
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }

    pub fn from_env() -> Result<Self> {
        let secret = env::var("PAYMENT_WEBHOOK_SECRET").context("PAYMENT_WEBHOOK_SECRET must be set")?;
        let webhook_secret =
            WebhookSecret::new(secret).map_err(|e| anyhow!("PAYMENT_WEBHOOK_SECRET: {e}"))?;
        let mut cfg = Self::new(webhook_secret);

        if let Ok(host) = env::var("HOST") {
            cfg.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            cfg.port = port.parse().context("PORT must be a port number")?;
        }
        cfg.database_url = env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        cfg.run_migrations = env_flag("RUN_MIGRATIONS").unwrap_or(false);
        if let Ok(raw) = env::var("WEBHOOK_MAX_BODY_BYTES") {
            cfg.webhook_max_body_bytes =
                raw.parse().context("WEBHOOK_MAX_BODY_BYTES must be a byte count")?;
        }

        if let Ok(base_url) = env::var("GATEWAY_BASE_URL") {
            let key_id = env::var("GATEWAY_KEY_ID").context("GATEWAY_KEY_ID must be set with GATEWAY_BASE_URL")?;
            let key_secret = env::var("GATEWAY_KEY_SECRET")
                .context("GATEWAY_KEY_SECRET must be set with GATEWAY_BASE_URL")?;
            let timeout_secs = env::var("GATEWAY_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(15);
            cfg.sandbox = key_id.contains("_test_");
            cfg.gateway = Some(HttpGatewayConfig {
                base_url,
                key_id,
                key_secret,
                timeout: Duration::from_secs(timeout_secs),
            });
        }
        if let Some(flag) = env_flag("GATEWAY_SANDBOX") {
            cfg.sandbox = flag;
        }
        if let Ok(currency) = env::var("GATEWAY_CURRENCY") {
            cfg.currency = currency;
        }
        if let Ok(raw) = env::var("REFUND_STRATEGIES") {
            cfg.refund_strategies = parse_strategies(&raw).map_err(|e| anyhow!("REFUND_STRATEGIES: {e}"))?;
        }
        if let Ok(raw) = env::var("CANCELLATION_WINDOW_MINUTES") {
            let minutes: i64 = raw.parse().context("CANCELLATION_WINDOW_MINUTES must be an integer")?;
            cfg.cancellation_window = chrono::Duration::minutes(minutes);
        }
        if let Ok(raw) = env::var("CORS_ALLOWED_ORIGINS") {
            cfg.cors_allowed_origins = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(cfg)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Parses an ordered, comma-separated strategy list such as `instant,normal,alternate`.
pub fn parse_strategies(raw: &str) -> Result<Vec<RefundMode>, String> {
    let mut modes = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mode = RefundMode::parse(part).ok_or_else(|| format!("unknown refund strategy '{part}'"))?;
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }
    if modes.is_empty() {
        return Err("at least one refund strategy is required".to_string());
    }
    Ok(modes)
}
