use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use common_auth::{AuthContext, MaybeAuth};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::app::AppState;
use crate::cancellation::{self, CancellationReceipt, Requester};
use crate::checkout::{place_order, CheckoutRequest};
use crate::model::{Order, OrderDetail, OrderWithItems};
use crate::store::OrderStore;

/// `POST /orders`. The session may arrive as a bearer header or as the
/// `credential` field of the body; the body field wins when both are sent.
pub async fn create_order(
    State(state): State<AppState>,
    MaybeAuth(bearer): MaybeAuth,
    Json(mut req): Json<CheckoutRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let caller = match req.credential.take().filter(|c| !c.trim().is_empty()) {
        Some(token) => {
            state
                .jwt_verifier
                .verify(token.trim())
                .map_err(|err| {
                    warn!(error = %err, "checkout credential rejected");
                    ApiError::unauthorized("Invalid user session")
                })?
                .subject
        }
        None => bearer
            .map(|ctx| ctx.user_id())
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?,
    };

    let outcome = place_order(&state, caller, req).await?;
    let status = if outcome.replayed { StatusCode::OK } else { StatusCode::CREATED };
    Ok((
        status,
        Json(json!({
            "orderId": outcome.order.id,
            "orderNumber": outcome.order.order_number.clone(),
            "replayed": outcome.replayed,
            "order": outcome.order,
        })),
    ))
}

pub(crate) async fn with_items(store: &dyn OrderStore, orders: Vec<Order>) -> ApiResult<Vec<OrderWithItems>> {
    let mut out = Vec::with_capacity(orders.len());
    for order in orders {
        let items = store.items_for_order(order.id).await?;
        out.push(OrderWithItems { order, items });
    }
    Ok(out)
}

/// `GET /orders`: the caller's own orders, newest first.
pub async fn list_orders(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Vec<OrderWithItems>>> {
    let orders = state.store.list_orders(Some(auth.user_id())).await?;
    Ok(Json(with_items(state.store.as_ref(), orders).await?))
}

/// `GET /orders/:id`. Other buyers' orders are reported as absent.
pub async fn get_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<OrderDetail>> {
    let store = state.store.as_ref();
    let order = store
        .order_by_id(id)
        .await?
        .filter(|o| o.user_id == auth.user_id())
        .ok_or_else(|| ApiError::not_found("order_not_found"))?;
    let items = store.items_for_order(order.id).await?;
    let refunds = store.refunds_for_order(order.id).await?;
    Ok(Json(OrderDetail { order, items, refunds }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /orders/:id/cancel`. The body is optional.
pub async fn cancel_order(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<CancellationReceipt>> {
    let reason = body.and_then(|Json(b)| b.reason).filter(|r| !r.trim().is_empty());
    let receipt = cancellation::cancel_order(&state, id, Requester::Buyer(auth.user_id()), reason).await?;
    Ok(Json(receipt))
}
