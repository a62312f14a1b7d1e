use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bigdecimal::BigDecimal;
use common_auth::{ensure_role, AuthContext, ROLE_ADMIN};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::cancellation::{self, CancellationReceipt, Requester};
use crate::model::{OrderStatus, OrderWithItems, PaymentStatus};
use crate::order_handlers::{with_items, CancelBody};
use crate::refunds::refund_order;

fn require_admin(auth: &AuthContext) -> ApiResult<()> {
    ensure_role(auth, &[ROLE_ADMIN]).map_err(|err| {
        warn!(user_id = %auth.user_id(), reason = %err.message(), "admin route denied");
        ApiError::ForbiddenMissingRole { role: ROLE_ADMIN, trace_id: None }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default)]
    pub payment_status: Option<String>,
}

/// `PATCH /admin/orders/:id/status`: direct overwrite, no transition rules.
pub async fn admin_update_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusUpdate>,
) -> ApiResult<Json<Value>> {
    require_admin(&auth)?;
    let status = OrderStatus::parse(body.status.trim()).ok_or_else(|| {
        ApiError::bad_request("invalid_status", format!("'{}' is not an order status", body.status))
    })?;
    let payment_status = match body.payment_status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(PaymentStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request("invalid_payment_status", format!("'{raw}' is not a payment status"))
        })?),
    };

    let order = state
        .store
        .update_status(id, status, payment_status)
        .await?
        .ok_or_else(|| ApiError::not_found("order_not_found"))?;
    info!(
        order_id = %order.id,
        admin = %auth.user_id(),
        status = status.as_str(),
        payment_status = payment_status.map(|p| p.as_str()),
        "admin updated order status"
    );
    Ok(Json(json!({ "order": order })))
}

/// `GET /admin/orders`: every buyer's orders, newest first.
pub async fn admin_list_orders(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<Vec<OrderWithItems>>> {
    require_admin(&auth)?;
    let orders = state.store.list_orders(None).await?;
    Ok(Json(with_items(state.store.as_ref(), orders).await?))
}

/// `POST /admin/orders/:id/cancel`: buyer cancellation minus the ownership check.
pub async fn admin_cancel_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<CancellationReceipt>> {
    require_admin(&auth)?;
    let reason = body.and_then(|Json(b)| b.reason).filter(|r| !r.trim().is_empty());
    let receipt = cancellation::cancel_order(&state, id, Requester::Admin, reason).await?;
    Ok(Json(receipt))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundBody {
    #[serde(default)]
    pub amount: Option<BigDecimal>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /admin/orders/:id/refunds`: full refund by default, partial when `amount` is given.
pub async fn admin_refund_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    body: Option<Json<RefundBody>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_admin(&auth)?;
    let RefundBody { amount, reason } = body.map(|Json(b)| b).unwrap_or_default();
    let summary = refund_order(&state, id, amount, reason.filter(|r| !r.trim().is_empty())).await?;
    let message = if summary.fully_refunded {
        "Full refund processed successfully"
    } else {
        "Partial refund processed successfully"
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "refund": summary.refund,
            "order": summary.order,
            "fullyRefunded": summary.fully_refunded,
            "strategy": summary.strategy.map(|mode| mode.as_str()),
            "message": message,
        })),
    ))
}
