use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONNECTION;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    GatewayError, GatewayOrder, GatewayPayment, GatewayRefund, GatewayResult, PaymentGateway,
    RefundMode,
};

#[derive(Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for HttpGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGatewayConfig")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// REST client for the payment gateway (basic auth with key id/secret).
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: Client,
    /// Separate HTTP/1.1 client without connection reuse, used by
    /// [`RefundMode::AlternateTransport`].
    fallback_client: Client,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let fallback_client = Client::builder()
            .timeout(config.timeout)
            .http1_only()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            config,
            client,
            fallback_client,
        })
    }

    /// Appends `segments` to the base URL. Each segment is percent-encoded as a
    /// whole, so ids can never add or climb path levels.
    fn url(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| GatewayError::Transport(format!("invalid gateway base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::Transport("gateway base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.config.key_id, Some(&self.config.key_secret))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> GatewayResult<T> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> GatewayResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorEnvelope>(&body)
        .ok()
        .and_then(|env| env.error);
    let code = detail
        .as_ref()
        .and_then(|d| d.code.clone())
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let description = detail
        .and_then(|d| d.description)
        .unwrap_or_else(|| body.chars().take(200).collect());
    debug!(status = status.as_u16(), %code, %description, "gateway returned an error");
    Err(GatewayError::Rejected {
        status: status.as_u16(),
        code,
        description,
    })
}

/// The gateway reports unknown payments as 404 or as a 400 whose description says so.
fn not_found(err: &GatewayError) -> bool {
    match err {
        GatewayError::Rejected { status, description, .. } => {
            *status == StatusCode::NOT_FOUND.as_u16()
                || (*status == StatusCode::BAD_REQUEST.as_u16()
                    && description.contains("does not exist"))
        }
        _ => false,
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: Option<&str>,
    ) -> GatewayResult<GatewayOrder> {
        let mut body = json!({ "amount": amount_minor, "currency": currency });
        if let Some(receipt) = receipt {
            body["receipt"] = json!(receipt);
        }
        self.send(self.client.post(self.url(&["orders"])?).json(&body))
            .await
    }

    async fn fetch_payment(&self, payment_id: &str) -> GatewayResult<GatewayPayment> {
        let request = self.client.get(self.url(&["payments", payment_id])?);
        match self.send::<GatewayPayment>(request).await {
            Err(err) if not_found(&err) => {
                warn!(payment_id, error = %err, "payment unknown to gateway");
                Err(GatewayError::NotFound(payment_id.to_string()))
            }
            other => other,
        }
    }

    async fn create_refund(
        &self,
        payment_id: &str,
        amount_minor: i64,
        mode: RefundMode,
    ) -> GatewayResult<GatewayRefund> {
        let path = self.url(&["payments", payment_id, "refund"])?;
        let request = match mode {
            RefundMode::Instant => self
                .client
                .post(path)
                .json(&json!({ "amount": amount_minor, "speed": "optimum" })),
            RefundMode::Normal => self.client.post(path).json(&json!({ "amount": amount_minor })),
            RefundMode::AlternateTransport => self
                .fallback_client
                .post(path)
                .header(CONNECTION, "close")
                .json(&json!({ "amount": amount_minor })),
        };
        self.send(request).await
    }
}
