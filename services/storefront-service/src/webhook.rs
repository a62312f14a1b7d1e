use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header::CONTENT_LENGTH, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bigdecimal::BigDecimal;
use common_crypto::SignatureError;
use common_http_errors::ApiError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::gateway::minor_units;
use crate::model::{processed_total, NewRefund, PaymentStatus, RefundStatus};
use crate::refunds::refunded_status;
use crate::store::{StoreError, StoreResult};

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Authenticates gateway webhooks: HMAC-SHA256 over the exact bytes received.
///
/// The body is buffered, verified, then handed on unchanged so the handler
/// parses precisely what was signed.
pub async fn verify_webhook(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    if signature.trim().is_empty() {
        warn!("webhook rejected: signature header missing");
        return ApiError::Unauthorized { code: "sig_missing", message: Some("missing signature".into()) }
            .into_response();
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, state.config.webhook_max_body_bytes).await {
        Ok(b) => b,
        Err(err) => {
            warn!(error = %err, "webhook rejected: body unreadable or too large");
            return ApiError::bad_request("malformed", "request body could not be read").into_response();
        }
    };

    if let Err(err) = state.config.webhook_secret.verify_hex(&bytes, &signature) {
        let code = match err {
            SignatureError::Malformed => "sig_malformed",
            _ => "sig_mismatch",
        };
        warn!(error = %err, body_len = bytes.len(), "webhook rejected: signature verification failed");
        return ApiError::Unauthorized { code, message: Some("invalid signature".into()) }.into_response();
    }

    if let Ok(len) = HeaderValue::from_str(&bytes.len().to_string()) {
        parts.headers.insert(CONTENT_LENGTH, len);
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityNotes {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "minor_units")]
    pub amount: i64,
    /// Gateways send `[]` for empty notes.
    #[serde(default, deserialize_with = "lenient_notes")]
    pub notes: EntityNotes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundEntity {
    pub id: String,
    pub payment_id: String,
    #[serde(deserialize_with = "minor_units")]
    pub amount: i64,
    #[serde(default, deserialize_with = "lenient_notes")]
    pub notes: EntityNotes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderEntity {
    pub id: String,
}

fn lenient_notes<'de, D>(deserializer: D) -> Result<EntityNotes, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Gateway events this service acts on. Anything else decodes to `Unrecognized`.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PaymentCaptured(PaymentEntity),
    PaymentFailed(PaymentEntity),
    RefundProcessed(RefundEntity),
    OrderPaid(OrderEntity),
    Unrecognized(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    entity: T,
}

fn entity<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T, serde_json::Error> {
    let wrapped: Wrapped<T> = serde_json::from_value(payload.get(key).cloned().unwrap_or(Value::Null))?;
    Ok(wrapped.entity)
}

impl WebhookEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        let payload = &envelope.payload;
        Ok(match envelope.event.as_str() {
            "payment.captured" => WebhookEvent::PaymentCaptured(entity(payload, "payment")?),
            "payment.failed" => WebhookEvent::PaymentFailed(entity(payload, "payment")?),
            "refund.created" | "refund.processed" => WebhookEvent::RefundProcessed(entity(payload, "refund")?),
            "order.paid" => WebhookEvent::OrderPaid(entity(payload, "order")?),
            _ => WebhookEvent::Unrecognized(envelope.event),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            WebhookEvent::PaymentCaptured(_) => "payment.captured",
            WebhookEvent::PaymentFailed(_) => "payment.failed",
            WebhookEvent::RefundProcessed(_) => "refund.processed",
            WebhookEvent::OrderPaid(_) => "order.paid",
            WebhookEvent::Unrecognized(_) => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// No local record matched; left for later reconciliation.
    Unmatched,
    Ignored,
}

impl EventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Unmatched => "unmatched",
            EventOutcome::Ignored => "ignored",
        }
    }
}

/// Signature is checked by [`verify_webhook`] before this runs.
pub async fn payment_webhook(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let event = WebhookEvent::parse(&body).map_err(|err| {
        warn!(error = %err, "webhook payload could not be decoded");
        ApiError::bad_request("malformed_payload", "webhook payload could not be decoded")
    })?;
    let name = event.name().to_string();
    let outcome = apply_event(&state, event).await?;
    state.metrics.webhook_event(&name, outcome.as_str());
    debug!(event = %name, outcome = outcome.as_str(), "webhook processed");
    Ok(Json(json!({ "received": true })))
}

/// Applies one event. Every write sets a known value so redelivery is harmless.
pub async fn apply_event(state: &AppState, event: WebhookEvent) -> StoreResult<EventOutcome> {
    match event {
        WebhookEvent::PaymentCaptured(payment) => payment_captured(state, payment).await,
        WebhookEvent::PaymentFailed(payment) => payment_failed(state, payment).await,
        WebhookEvent::RefundProcessed(refund) => refund_processed(state, refund).await,
        WebhookEvent::OrderPaid(order) => order_paid(state, order).await,
        WebhookEvent::Unrecognized(name) => {
            info!(event = %name, "ignoring unrecognized webhook event");
            Ok(EventOutcome::Ignored)
        }
    }
}

async fn payment_captured(state: &AppState, payment: PaymentEntity) -> StoreResult<EventOutcome> {
    let store = state.store.as_ref();
    let mut target = store.order_by_payment_id(&payment.id).await?;

    if target.is_none() {
        if let Some(gateway_order_id) = payment.order_id.as_deref() {
            if let Some(order) = store.order_by_gateway_order_id(gateway_order_id).await? {
                target = match store.link_payment_id(order.id, &payment.id).await {
                    Ok(linked) => linked,
                    // Checkout recorded the payment id on another row in the meantime.
                    Err(StoreError::DuplicatePaymentId(_)) => store.order_by_payment_id(&payment.id).await?,
                    Err(e) => return Err(e),
                };
            }
        }
    }

    let Some(order) = target else {
        warn!(
            payment_id = %payment.id,
            gateway_order_id = payment.order_id.as_deref().unwrap_or("-"),
            amount_minor = payment.amount,
            "payment.captured for unknown order; awaiting checkout or manual reconciliation"
        );
        return Ok(EventOutcome::Unmatched);
    };

    store
        .set_payment_status(order.id, PaymentStatus::Captured, payment.notes.signature.as_deref())
        .await?;
    info!(order_id = %order.id, payment_id = %payment.id, "payment captured");
    Ok(EventOutcome::Applied)
}

async fn payment_failed(state: &AppState, payment: PaymentEntity) -> StoreResult<EventOutcome> {
    let store = state.store.as_ref();
    let Some(order) = store.order_by_payment_id(&payment.id).await? else {
        warn!(payment_id = %payment.id, "payment.failed for unknown order");
        return Ok(EventOutcome::Unmatched);
    };
    store.set_payment_status(order.id, PaymentStatus::Failed, None).await?;
    info!(order_id = %order.id, payment_id = %payment.id, "payment failed");
    Ok(EventOutcome::Applied)
}

async fn order_paid(state: &AppState, entity: OrderEntity) -> StoreResult<EventOutcome> {
    let store = state.store.as_ref();
    let Some(order) = store.order_by_gateway_order_id(&entity.id).await? else {
        warn!(gateway_order_id = %entity.id, "order.paid for unknown order");
        return Ok(EventOutcome::Unmatched);
    };
    store.set_payment_status(order.id, PaymentStatus::Captured, None).await?;
    info!(order_id = %order.id, gateway_order_id = %entity.id, "order paid");
    Ok(EventOutcome::Applied)
}

async fn refund_processed(state: &AppState, refund: RefundEntity) -> StoreResult<EventOutcome> {
    let store = state.store.as_ref();

    if let Some(existing) = store.refund_by_gateway_id(&refund.id).await? {
        if existing.status != RefundStatus::Processed {
            store
                .set_refund_status(existing.id, RefundStatus::Processed, Some(&refund.id))
                .await?;
        }
        sync_refunded_status(state, existing.order_id).await?;
        info!(order_id = %existing.order_id, gateway_refund_id = %refund.id, "refund confirmed");
        return Ok(EventOutcome::Applied);
    }

    let Some(order) = store.order_by_payment_id(&refund.payment_id).await? else {
        warn!(gateway_refund_id = %refund.id, payment_id = %refund.payment_id, "refund for unknown order");
        return Ok(EventOutcome::Unmatched);
    };

    let amount = common_money::from_minor_units(refund.amount);
    let refunds = store.refunds_for_order(order.id).await?;
    let pending = refunds.iter().find(|r| {
        r.gateway_refund_id.is_none() && r.status != RefundStatus::Processed && r.amount == amount
    });

    if let Some(local) = pending {
        match store
            .set_refund_status(local.id, RefundStatus::Processed, Some(&refund.id))
            .await
        {
            Ok(_) | Err(StoreError::DuplicateRefundId(_)) => {}
            Err(e) => return Err(e),
        }
        info!(order_id = %order.id, refund_id = %local.id, gateway_refund_id = %refund.id, "adopted local refund");
    } else {
        let processed = processed_total(&refunds);
        if &processed + &amount > order.amount {
            warn!(
                order_id = %order.id,
                gateway_refund_id = %refund.id,
                amount = %amount,
                processed = %processed,
                order_amount = %order.amount,
                "external refund would exceed order amount; not recorded"
            );
            return Ok(EventOutcome::Ignored);
        }
        let reason = refund.notes.reason.clone().unwrap_or_else(|| "Refund processed by gateway".to_string());
        match store
            .insert_refund(NewRefund {
                order_id: order.id,
                amount,
                status: RefundStatus::Processed,
                reason: Some(reason),
                gateway_refund_id: Some(refund.id.clone()),
            })
            .await
        {
            // A concurrent delivery of the same event already recorded it.
            Ok(_) | Err(StoreError::DuplicateRefundId(_)) => {}
            Err(e) => return Err(e),
        }
        info!(order_id = %order.id, gateway_refund_id = %refund.id, "recorded gateway-originated refund");
    }

    sync_refunded_status(state, order.id).await?;
    Ok(EventOutcome::Applied)
}

async fn sync_refunded_status(state: &AppState, order_id: Uuid) -> StoreResult<()> {
    let store = state.store.as_ref();
    let Some(order) = store.order_by_id(order_id).await? else {
        return Ok(());
    };
    let processed: BigDecimal = processed_total(&store.refunds_for_order(order_id).await?);
    if let Some(status) = refunded_status(&order.amount, &processed) {
        if status != order.payment_status {
            store.set_payment_status(order_id, status, None).await?;
        }
    }
    Ok(())
}
