use chrono::{DateTime, Duration, Utc};
use common_http_errors::ApiError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::gateway::GatewayError;
use crate::model::{processed_total, NewRefund, Order, OrderStatus, PaymentStatus, RefundStatus};
use crate::refunds::{attempt_refund, mark_failed_unless_settled};
use crate::store::StoreError;

const MSG_REFUNDED: &str =
    "Order cancelled and refund processed successfully. Amount will be credited within 3-5 business days.";
const MSG_SANDBOX_PENDING: &str =
    "Order cancelled. Refund has been initiated and will be processed. Amount will be credited within 3-5 business days.";
const MSG_MANUAL_REFUND: &str =
    "Order cancelled. Refund initiation may require manual processing. Please contact support if you need assistance.";
const MSG_CANCELLED: &str = "Order cancelled successfully.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Buyer(Uuid),
    /// Admins bypass ownership but not the other eligibility rules.
    Admin,
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("order {0} not found")]
    NotFound(Uuid),
    #[error("order is already cancelled")]
    AlreadyCancelled,
    #[error("delivered orders cannot be cancelled")]
    Delivered,
    #[error("cancellation window expired {hours_since}h after placement")]
    WindowExpired { hours_since: i64, window_hours: i64 },
    #[error("requester does not own the order")]
    NotOwner,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CancelError> for ApiError {
    fn from(err: CancelError) -> Self {
        match err {
            CancelError::NotFound(_) => ApiError::not_found("order_not_found"),
            CancelError::AlreadyCancelled => {
                ApiError::bad_request("already_cancelled", "Order is already cancelled")
            }
            CancelError::Delivered => {
                ApiError::bad_request("cannot_cancel_delivered", "Cannot cancel delivered order")
            }
            CancelError::WindowExpired { window_hours, .. } => ApiError::bad_request(
                "cancellation_window_expired",
                format!(
                    "Orders can only be cancelled within {window_hours} hours of placement. Please contact support for assistance."
                ),
            ),
            CancelError::NotOwner => {
                ApiError::forbidden("not_order_owner", "You can only cancel your own orders")
            }
            CancelError::Store(e) => ApiError::from(e),
        }
    }
}

/// Eligibility rules, checked before anything is written or the gateway is called.
pub fn check_eligibility(
    order: &Order,
    requester: Requester,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<(), CancelError> {
    if let Requester::Buyer(caller) = requester {
        if caller != order.user_id {
            return Err(CancelError::NotOwner);
        }
    }
    match order.status {
        OrderStatus::Cancelled => return Err(CancelError::AlreadyCancelled),
        OrderStatus::Delivered => return Err(CancelError::Delivered),
        _ => {}
    }
    let elapsed = now - order.created_at;
    if elapsed > window {
        return Err(CancelError::WindowExpired {
            hours_since: elapsed.num_hours(),
            window_hours: window.num_hours(),
        });
    }
    Ok(())
}

/// Result of the optional refund step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    /// Nothing was charged online, so nothing to return.
    NotApplicable,
    /// A safe continuation existed; no money moved.
    Skipped,
    Failed,
    Processed,
}

impl RefundOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RefundOutcome::NotApplicable => "not_applicable",
            RefundOutcome::Skipped => "skipped",
            RefundOutcome::Failed => "failed",
            RefundOutcome::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationReceipt {
    pub status: &'static str,
    pub refund_processed: bool,
    pub message: &'static str,
    pub order: Order,
    /// The gateway is a sandbox and the refund did not complete here.
    pub sandbox: bool,
}

/// Cancels an order and, where an online payment was captured, returns the money.
///
/// A refund that cannot be completed never blocks the cancellation; the
/// receipt tells the caller which of the two happened.
pub async fn cancel_order(
    state: &AppState,
    order_id: Uuid,
    requester: Requester,
    reason: Option<String>,
) -> Result<CancellationReceipt, CancelError> {
    let store = state.store.as_ref();
    let order = store
        .order_by_id(order_id)
        .await?
        .ok_or(CancelError::NotFound(order_id))?;
    check_eligibility(&order, requester, Utc::now(), state.config.cancellation_window)?;

    let refundable = order.payment_status == PaymentStatus::Captured && order.gateway_payment_id.is_some();
    let outcome = match order.gateway_payment_id.as_deref() {
        Some(payment_id) if refundable => refund_for_cancellation(state, &order, payment_id, reason).await,
        _ => RefundOutcome::NotApplicable,
    };
    let refund_processed = outcome == RefundOutcome::Processed;

    let payment_status = refund_processed.then_some(PaymentStatus::Refunded);
    let updated = store
        .update_status(order.id, OrderStatus::Cancelled, payment_status)
        .await?
        .ok_or(CancelError::NotFound(order.id))?;
    state.metrics.cancellation(outcome.as_str());

    let message = if refund_processed {
        MSG_REFUNDED
    } else if refundable && state.config.sandbox {
        MSG_SANDBOX_PENDING
    } else if refundable {
        MSG_MANUAL_REFUND
    } else {
        MSG_CANCELLED
    };
    info!(order_id = %updated.id, refund = outcome.as_str(), admin = matches!(requester, Requester::Admin), "order cancelled");

    Ok(CancellationReceipt {
        status: OrderStatus::Cancelled.as_str(),
        refund_processed,
        message,
        order: updated,
        sandbox: state.config.sandbox && !refund_processed,
    })
}

async fn refund_for_cancellation(
    state: &AppState,
    order: &Order,
    payment_id: &str,
    reason: Option<String>,
) -> RefundOutcome {
    let payment = match state.gateway.fetch_payment(payment_id).await {
        Ok(payment) => payment,
        Err(GatewayError::NotFound(_)) => {
            warn!(order_id = %order.id, payment_id, "payment unknown to gateway; cancelling without refund");
            return RefundOutcome::Skipped;
        }
        Err(err) => {
            warn!(order_id = %order.id, payment_id, error = %err, "could not fetch payment; cancelling without refund");
            return RefundOutcome::Skipped;
        }
    };
    if !payment.is_captured() {
        warn!(order_id = %order.id, payment_id, gateway_status = %payment.status, "payment not captured at gateway; skipping refund");
        return RefundOutcome::Skipped;
    }

    let amount_minor = match common_money::to_minor_units(&order.amount) {
        Ok(minor) => minor,
        Err(err) => {
            error!(order_id = %order.id, amount = %order.amount, error = %err, "order amount not representable in minor units");
            return RefundOutcome::Skipped;
        }
    };
    if amount_minor > payment.refundable() {
        warn!(
            order_id = %order.id,
            payment_id,
            amount_minor,
            captured = payment.amount,
            already_refunded = payment.amount_refunded,
            "refund exceeds gateway refundable balance; skipping"
        );
        return RefundOutcome::Skipped;
    }
    match state.store.refunds_for_order(order.id).await {
        Ok(existing) => {
            let processed = processed_total(&existing);
            if processed > bigdecimal::BigDecimal::from(0) {
                warn!(order_id = %order.id, processed = %processed, "order already has processed refunds; skipping full refund");
                return RefundOutcome::Skipped;
            }
        }
        Err(err) => {
            error!(order_id = %order.id, error = %err, "could not read refund history; skipping refund");
            return RefundOutcome::Skipped;
        }
    }

    let record = match state
        .store
        .insert_refund(NewRefund {
            order_id: order.id,
            amount: order.amount.clone(),
            status: RefundStatus::Initiated,
            reason: Some(reason.unwrap_or_else(|| "Order cancellation".to_string())),
            gateway_refund_id: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => {
            error!(order_id = %order.id, error = %err, "could not record refund; skipping gateway call");
            return RefundOutcome::Skipped;
        }
    };

    match attempt_refund(
        state.gateway.as_ref(),
        &state.metrics,
        &state.config.refund_strategies,
        payment_id,
        amount_minor,
    )
    .await
    {
        Ok((refund, strategy)) => {
            if let Err(err) = state
                .store
                .set_refund_status(record.id, RefundStatus::Processed, Some(&refund.id))
                .await
            {
                error!(refund_id = %record.id, gateway_refund_id = %refund.id, error = %err, "refund processed at gateway but local update failed");
            }
            info!(order_id = %order.id, gateway_refund_id = %refund.id, strategy = strategy.as_str(), "cancellation refund processed");
            RefundOutcome::Processed
        }
        Err(err) => {
            if mark_failed_unless_settled(state.store.as_ref(), &record).await.is_some() {
                info!(order_id = %order.id, refund_id = %record.id, "cancellation refund settled by webhook");
                return RefundOutcome::Processed;
            }
            if state.config.sandbox && err.is_bad_request() {
                warn!(order_id = %order.id, payment_id, amount_minor, error = %err, "sandbox gateway rejected refund for this payment method");
            } else {
                error!(order_id = %order.id, payment_id, amount_minor, error = %err, "all refund strategies failed during cancellation");
            }
            RefundOutcome::Failed
        }
    }
}
