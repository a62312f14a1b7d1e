use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod http;
pub mod stub;

pub use self::http::{HttpGateway, HttpGatewayConfig};
pub use self::stub::StubGateway;

/// How a refund is submitted. The order in which modes are tried is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundMode {
    /// Accelerated settlement (`speed=optimum`).
    Instant,
    /// Standard settlement.
    Normal,
    /// Standard settlement over a separate, non-pooled HTTP/1.1 connection.
    AlternateTransport,
}

impl RefundMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundMode::Instant => "instant",
            RefundMode::Normal => "normal",
            RefundMode::AlternateTransport => "alternate",
        }
    }

    pub fn parse(s: &str) -> Option<RefundMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Some(RefundMode::Instant),
            "normal" => Some(RefundMode::Normal),
            "alternate" | "alternate_transport" => Some(RefundMode::AlternateTransport),
            _ => None,
        }
    }
}

pub const DEFAULT_REFUND_STRATEGIES: [RefundMode; 3] =
    [RefundMode::Instant, RefundMode::Normal, RefundMode::AlternateTransport];

/// Gateway amounts are integers in minor units but some endpoints send them as strings.
pub(crate) fn minor_units<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
        Null,
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) if s.trim().is_empty() => Ok(0),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Null => Ok(0),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    pub status: String,
    #[serde(deserialize_with = "minor_units")]
    pub amount: i64,
    #[serde(default, deserialize_with = "minor_units")]
    pub amount_refunded: i64,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

impl GatewayPayment {
    pub fn is_captured(&self) -> bool {
        self.status == "captured" && self.amount > 0
    }

    /// Captured amount still available for refunds, in minor units.
    pub fn refundable(&self) -> i64 {
        (self.amount - self.amount_refunded).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    #[serde(default, deserialize_with = "minor_units")]
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    #[serde(deserialize_with = "minor_units")]
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment {0} does not exist at the gateway")]
    NotFound(String),
    #[error("gateway rejected the request ({status} {code}): {description}")]
    Rejected {
        status: u16,
        code: String,
        description: String,
    },
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// A 400 `BAD_REQUEST_ERROR` is what sandbox accounts return for rails that cannot be
    /// refunded there; it is an environment limitation rather than a fault.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, GatewayError::Rejected { status: 400, code, .. } if code == "BAD_REQUEST_ERROR")
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: Option<&str>,
    ) -> GatewayResult<GatewayOrder>;

    /// Live payment state; never the locally cached value.
    async fn fetch_payment(&self, payment_id: &str) -> GatewayResult<GatewayPayment>;

    async fn create_refund(
        &self,
        payment_id: &str,
        amount_minor: i64,
        mode: RefundMode,
    ) -> GatewayResult<GatewayRefund>;
}
