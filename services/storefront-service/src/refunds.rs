use bigdecimal::BigDecimal;
use common_http_errors::ApiError;
use common_observability::ReconciliationMetrics;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::gateway::{GatewayError, GatewayRefund, PaymentGateway, RefundMode};
use crate::model::{processed_total, NewRefund, Order, PaymentStatus, Refund, RefundStatus};
use crate::store::{OrderStore, StoreError};

/// Runs the configured refund strategies in order until one is accepted.
///
/// Every rejection is logged and counted; the last error is returned when the
/// list is exhausted. An unknown payment stops the sequence early since no
/// other mode can succeed against it.
pub async fn attempt_refund(
    gateway: &dyn PaymentGateway,
    metrics: &ReconciliationMetrics,
    strategies: &[RefundMode],
    payment_id: &str,
    amount_minor: i64,
) -> Result<(GatewayRefund, RefundMode), GatewayError> {
    let mut last_error = GatewayError::Transport("no refund strategies configured".to_string());
    for &mode in strategies {
        match gateway.create_refund(payment_id, amount_minor, mode).await {
            Ok(refund) => {
                metrics.refund_attempt(mode.as_str(), true);
                info!(payment_id, amount_minor, strategy = mode.as_str(), refund_id = %refund.id, "refund accepted");
                return Ok((refund, mode));
            }
            Err(err) => {
                metrics.refund_attempt(mode.as_str(), false);
                warn!(payment_id, amount_minor, strategy = mode.as_str(), error = %err, "refund strategy rejected");
                let stop = matches!(err, GatewayError::NotFound(_));
                last_error = err;
                if stop {
                    break;
                }
            }
        }
    }
    Err(last_error)
}

/// Payment status implied by the processed refund total.
pub fn refunded_status(order_amount: &BigDecimal, processed: &BigDecimal) -> Option<PaymentStatus> {
    if processed >= order_amount {
        Some(PaymentStatus::Refunded)
    } else if *processed > BigDecimal::from(0) {
        Some(PaymentStatus::PartiallyRefunded)
    } else {
        None
    }
}

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error("order has no gateway payment id")]
    NoPaymentId,
    #[error("order is already fully refunded")]
    AlreadyRefunded,
    #[error("invalid refund amount: {0}")]
    InvalidAmount(String),
    #[error("refund amount cannot exceed order amount")]
    ExceedsOrder,
    #[error("refund amount exceeds remaining refundable amount (remaining {remaining}, requested {requested})")]
    ExceedsRemaining { remaining: BigDecimal, requested: BigDecimal },
    #[error("gateway refused the refund: {0}")]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RefundError> for ApiError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::OrderNotFound(_) => ApiError::not_found("order_not_found"),
            RefundError::NoPaymentId => {
                ApiError::bad_request("no_payment_id", "Order does not have a gateway payment id")
            }
            RefundError::AlreadyRefunded => {
                ApiError::bad_request("already_refunded", "Order is already fully refunded")
            }
            RefundError::InvalidAmount(detail) => ApiError::bad_request("invalid_amount", detail),
            RefundError::ExceedsOrder => ApiError::bad_request(
                "amount_exceeds_order",
                "Refund amount cannot exceed order amount",
            ),
            e @ RefundError::ExceedsRemaining { .. } => {
                ApiError::bad_request("amount_exceeds_remaining", e.to_string())
            }
            RefundError::Gateway(_) => ApiError::Upstream {
                code: "refund_failed",
                trace_id: None,
                message: Some("The payment gateway did not accept the refund".to_string()),
            },
            RefundError::Store(e) => ApiError::from(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundSummary {
    pub refund: Refund,
    pub order: Order,
    pub fully_refunded: bool,
    /// `None` when the gateway call failed locally but the refund webhook had
    /// already recorded the refund as processed.
    pub strategy: Option<RefundMode>,
}

/// Marks a refund failed once every strategy was rejected.
///
/// A refund webhook may have recorded the same row as processed while the
/// strategies were still running (e.g. a timeout on a refund the gateway did
/// accept). That row is left as is and returned.
pub(crate) async fn mark_failed_unless_settled(store: &dyn OrderStore, record: &Refund) -> Option<Refund> {
    match store.mark_refund_failed(record.id).await {
        Ok(Some(_)) => None,
        Ok(None) => match store.refunds_for_order(record.order_id).await {
            Ok(refunds) => {
                let settled = refunds
                    .into_iter()
                    .find(|r| r.id == record.id && r.status == RefundStatus::Processed);
                if let Some(refund) = &settled {
                    warn!(
                        refund_id = %refund.id,
                        gateway_refund_id = refund.gateway_refund_id.as_deref().unwrap_or_default(),
                        "strategies failed but refund was already recorded as processed"
                    );
                }
                settled
            }
            Err(err) => {
                error!(refund_id = %record.id, error = %err, "could not re-read refund after failed strategies");
                None
            }
        },
        Err(err) => {
            error!(refund_id = %record.id, error = %err, "failed to mark refund failed");
            None
        }
    }
}

/// Admin-issued full or partial refund.
///
/// All checks run before the gateway is called. The refund row is written as
/// `initiated` first so a crash mid-call leaves a trail.
pub async fn refund_order(
    state: &AppState,
    order_id: Uuid,
    amount: Option<BigDecimal>,
    reason: Option<String>,
) -> Result<RefundSummary, RefundError> {
    let store = state.store.as_ref();
    let order = store
        .order_by_id(order_id)
        .await?
        .ok_or(RefundError::OrderNotFound(order_id))?;
    let payment_id = order
        .gateway_payment_id
        .clone()
        .ok_or(RefundError::NoPaymentId)?;
    if order.payment_status == PaymentStatus::Refunded {
        return Err(RefundError::AlreadyRefunded);
    }

    let existing = store.refunds_for_order(order.id).await?;
    let already = processed_total(&existing);
    let remaining = &order.amount - &already;
    let requested = common_money::normalize_scale(&amount.unwrap_or_else(|| remaining.clone()));

    if requested <= BigDecimal::from(0) {
        return Err(RefundError::InvalidAmount(format!("{requested} must be positive")));
    }
    if requested > order.amount {
        return Err(RefundError::ExceedsOrder);
    }
    if requested > remaining {
        return Err(RefundError::ExceedsRemaining { remaining, requested });
    }
    let amount_minor = common_money::to_minor_units(&requested)
        .map_err(|e| RefundError::InvalidAmount(e.to_string()))?;

    let record = store
        .insert_refund(NewRefund {
            order_id: order.id,
            amount: requested.clone(),
            status: RefundStatus::Initiated,
            reason: Some(reason.unwrap_or_else(|| "Customer request".to_string())),
            gateway_refund_id: None,
        })
        .await?;

    let outcome = attempt_refund(
        state.gateway.as_ref(),
        &state.metrics,
        &state.config.refund_strategies,
        &payment_id,
        amount_minor,
    )
    .await;

    let (refund, strategy) = match outcome {
        Ok((gateway_refund, strategy)) => {
            // The money has moved at this point; bookkeeping failures are logged and
            // left for the refund webhook to reconcile.
            let refund = match store
                .set_refund_status(record.id, RefundStatus::Processed, Some(&gateway_refund.id))
                .await
            {
                Ok(Some(updated)) => updated,
                Ok(None) | Err(_) => {
                    error!(refund_id = %record.id, gateway_refund_id = %gateway_refund.id, "refund processed at gateway but local update failed");
                    Refund {
                        status: RefundStatus::Processed,
                        gateway_refund_id: Some(gateway_refund.id.clone()),
                        ..record
                    }
                }
            };
            (refund, Some(strategy))
        }
        Err(err) => match mark_failed_unless_settled(store, &record).await {
            Some(settled) => (settled, None),
            None => {
                error!(order_id = %order.id, payment_id, amount_minor, sandbox = state.config.sandbox, error = %err, "all refund strategies failed");
                return Err(RefundError::Gateway(err));
            }
        },
    };

    let processed = &already + &requested;
    let fully_refunded = processed >= order.amount;
    let order = match refunded_status(&order.amount, &processed) {
        Some(status) => match store.set_payment_status(order.id, status, None).await {
            Ok(Some(updated)) => updated,
            Ok(None) => order,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "failed to record refunded payment status");
                order
            }
        },
        None => order,
    };

    info!(order_id = %order.id, refund_id = %refund.id, amount = %requested, fully_refunded, "refund recorded");
    Ok(RefundSummary {
        refund,
        order,
        fully_refunded,
        strategy,
    })
}
