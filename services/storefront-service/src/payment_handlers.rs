use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use bigdecimal::BigDecimal;
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct PaymentOrderRequest {
    /// Major units, e.g. `499.00`.
    pub amount: BigDecimal,
    #[serde(default)]
    pub receipt: Option<String>,
}

/// `POST /payments/orders`: opens a gateway order the buyer's client then pays against.
pub async fn create_payment_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<PaymentOrderRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if req.amount <= BigDecimal::from(0) {
        return Err(ApiError::bad_request("invalid_amount", "Amount must be positive"));
    }
    let amount_minor = common_money::to_minor_units(&req.amount)
        .map_err(|e| ApiError::bad_request("invalid_amount", e.to_string()))?;
    let receipt = req
        .receipt
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| format!("rcpt_{}", chrono::Utc::now().timestamp_millis()));

    let order = state
        .gateway
        .create_order(amount_minor, &state.config.currency, Some(&receipt))
        .await
        .map_err(|err| {
            error!(user_id = %auth.user_id(), amount_minor, error = %err, "gateway order creation failed");
            ApiError::Upstream {
                code: "gateway_unavailable",
                trace_id: None,
                message: Some("Could not create payment order".to_string()),
            }
        })?;

    info!(user_id = %auth.user_id(), gateway_order_id = %order.id, amount_minor, "gateway order created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": order.id,
            "amount": order.amount,
            "currency": order.currency,
            "receipt": order.receipt,
        })),
    ))
}
