use bigdecimal::BigDecimal;
use chrono::Utc;
use common_http_errors::ApiError;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::model::{
    generate_order_number, CartLine, NewOrder, NewOrderItem, Order, PaymentMethod, PaymentStatus,
    ShippingAddress,
};
use crate::store::StoreError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub buyer_id: Uuid,
    pub items: Vec<CartLine>,
    pub shipping_address: ShippingAddress,
    pub amount: BigDecimal,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub gateway_order_id: Option<String>,
    #[serde(default)]
    pub gateway_payment_id: Option<String>,
    /// Session token; the Authorization header is used when absent.
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub order: Order,
    /// True when an existing order for the payment id was returned.
    pub replayed: bool,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("session does not match buyer")]
    Unauthorized,
    #[error("order for this payment belongs to another buyer")]
    ForeignOrder,
    #[error("{1}")]
    Invalid(&'static str, String),
    #[error("failed to create order items: {0}")]
    Items(StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::Unauthorized => ApiError::unauthorized("Invalid user session"),
            CheckoutError::ForeignOrder => {
                ApiError::forbidden("payment_owned_by_other_buyer", "Payment is linked to another account")
            }
            CheckoutError::Invalid(code, message) => ApiError::bad_request(code, message),
            e @ (CheckoutError::Items(_) | CheckoutError::Store(_)) => ApiError::internal(e, None),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Gateway ids are opaque tokens like `pay_29QQoUBi66xm2f`; they end up in
/// gateway request paths, so nothing outside `[A-Za-z0-9_]` is accepted.
fn is_gateway_id(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn validate_gateway_id(code: &'static str, value: Option<&str>) -> Result<(), CheckoutError> {
    match value {
        Some(id) if !is_gateway_id(id) => Err(CheckoutError::Invalid(
            code,
            "Gateway ids may only contain letters, digits and underscores".into(),
        )),
        _ => Ok(()),
    }
}

fn validate(req: &CheckoutRequest) -> Result<(), CheckoutError> {
    if req.items.is_empty() {
        return Err(CheckoutError::Invalid("empty_cart", "Order must contain at least one item".into()));
    }
    for line in &req.items {
        if line.quantity <= 0 {
            return Err(CheckoutError::Invalid(
                "invalid_quantity",
                format!("Quantity for '{}' must be positive", line.name),
            ));
        }
        if line.price < BigDecimal::from(0) {
            return Err(CheckoutError::Invalid(
                "invalid_price",
                format!("Price for '{}' must not be negative", line.name),
            ));
        }
    }
    if req.amount <= BigDecimal::from(0) {
        return Err(CheckoutError::Invalid("invalid_amount", "Order amount must be positive".into()));
    }
    common_money::to_minor_units(&req.amount)
        .map_err(|e| CheckoutError::Invalid("invalid_amount", e.to_string()))?;
    Ok(())
}

/// Creates the order for a completed payment attempt, or returns the one that
/// already exists for the same gateway payment id.
///
/// `caller` is the identity verified from the session credential.
pub async fn place_order(
    state: &AppState,
    caller: Uuid,
    mut req: CheckoutRequest,
) -> Result<CheckoutOutcome, CheckoutError> {
    if caller != req.buyer_id {
        warn!(%caller, buyer_id = %req.buyer_id, "checkout identity mismatch");
        return Err(CheckoutError::Unauthorized);
    }
    validate(&req)?;
    let payment_id = non_empty(req.gateway_payment_id.take());
    let gateway_order_id = non_empty(req.gateway_order_id.take());
    validate_gateway_id("invalid_payment_id", payment_id.as_deref())?;
    validate_gateway_id("invalid_gateway_order_id", gateway_order_id.as_deref())?;
    if !req.payment_method.is_cod() && payment_id.is_none() {
        return Err(CheckoutError::Invalid(
            "payment_id_required",
            "A gateway payment id is required for prepaid orders".into(),
        ));
    }

    let store = state.store.as_ref();

    if let Some(pid) = payment_id.as_deref() {
        if let Some(existing) = store.order_by_payment_id(pid).await? {
            ensure_same_buyer(&existing, caller)?;
            state.metrics.checkout("replayed");
            info!(order_id = %existing.id, payment_id = pid, "checkout replay returned existing order");
            return Ok(CheckoutOutcome { order: existing, replayed: true });
        }
    }

    let payment_status = if req.payment_method.is_cod() {
        PaymentStatus::Created
    } else {
        // Optimistic until the gateway webhook confirms or corrects it.
        PaymentStatus::Captured
    };
    let new_order = NewOrder {
        order_number: generate_order_number(Utc::now()),
        user_id: req.buyer_id,
        amount: req.amount.clone(),
        payment_method: req.payment_method,
        payment_status,
        gateway_order_id,
        gateway_payment_id: payment_id.clone(),
        shipping_address: req.shipping_address.clone(),
    };

    let (order, created) = match store.insert_order(new_order).await {
        Ok(order) => (order, true),
        Err(StoreError::DuplicatePaymentId(pid)) => {
            let winner = store.order_by_payment_id(&pid).await?.ok_or_else(|| {
                StoreError::Unavailable(format!("order for payment {pid} vanished after conflict"))
            })?;
            ensure_same_buyer(&winner, caller)?;
            state.metrics.checkout("race_lost");
            info!(order_id = %winner.id, payment_id = %pid, "lost insert race; using existing order");
            (winner, false)
        }
        Err(e) => return Err(e.into()),
    };

    // Creator and race loser both go through the store's check-and-insert, so
    // only one item snapshot is kept however the two interleave.
    let items: Vec<NewOrderItem> = req.items.iter().map(NewOrderItem::from).collect();
    match store.insert_items_if_absent(order.id, &items).await {
        Ok(Some(_)) => {}
        Ok(None) => debug!(order_id = %order.id, "order items already present"),
        Err(err) => {
            error!(order_id = %order.id, error = %err, "order item insert failed");
            if created {
                if let Err(del) = store.delete_order(order.id).await {
                    error!(order_id = %order.id, error = %del, "rollback of empty order failed");
                }
            }
            return Err(CheckoutError::Items(err));
        }
    }

    if created {
        state.metrics.checkout("created");
        info!(order_id = %order.id, order_number = %order.order_number, payment_method = order.payment_method.map(|m| m.as_str()), "order created");
    }
    Ok(CheckoutOutcome { order, replayed: !created })
}

fn ensure_same_buyer(order: &Order, caller: Uuid) -> Result<(), CheckoutError> {
    if order.user_id == caller {
        Ok(())
    } else {
        warn!(order_id = %order.id, %caller, "payment id already linked to another buyer's order");
        Err(CheckoutError::ForeignOrder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::gateway::StubGateway;
    use crate::model::OrderStatus;
    use crate::store::OrderStore;
    use crate::test_support::{address, state_with, state_with_store, FaultyStore};

    fn request(buyer: Uuid, method: PaymentMethod, payment_id: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            buyer_id: buyer,
            items: vec![
                CartLine { product_id: None, name: "Brass Lamp".into(), price: BigDecimal::from(450), quantity: 1 },
                CartLine { product_id: None, name: "Cotton Runner".into(), price: BigDecimal::from_str("49.00").unwrap(), quantity: 2 },
            ],
            shipping_address: address(),
            amount: BigDecimal::from(548),
            payment_method: method,
            gateway_order_id: payment_id.map(|p| format!("order_{p}")),
            gateway_payment_id: payment_id.map(str::to_string),
            credential: None,
        }
    }

    #[tokio::test]
    async fn cod_order_is_created_with_pending_payment() {
        let (state, store, _) = state_with(StubGateway::new());
        let buyer = Uuid::new_v4();

        let outcome = place_order(&state, buyer, request(buyer, PaymentMethod::Cod, None)).await.unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.order.payment_status, PaymentStatus::Created);
        assert_eq!(outcome.order.status, OrderStatus::Created);
        assert!(outcome.order.gateway_payment_id.is_none());
        assert_eq!(store.items_for_order(outcome.order.id).await.unwrap().len(), 2);
        assert!(store.refunds_for_order(outcome.order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identity_mismatch_is_rejected_without_side_effects() {
        let (state, store, _) = state_with(StubGateway::new());
        let err = place_order(&state, Uuid::new_v4(), request(Uuid::new_v4(), PaymentMethod::Cod, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Unauthorized));
        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn prepaid_order_requires_payment_id() {
        let (state, _, _) = state_with(StubGateway::new());
        let buyer = Uuid::new_v4();
        let err = place_order(&state, buyer, request(buyer, PaymentMethod::Upi, None)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Invalid("payment_id_required", _)));
    }

    #[tokio::test]
    async fn repeated_checkout_returns_same_order_without_new_items() {
        let (state, store, _) = state_with(StubGateway::new());
        let buyer = Uuid::new_v4();

        let first = place_order(&state, buyer, request(buyer, PaymentMethod::Card, Some("pay_123"))).await.unwrap();
        assert_eq!(first.order.payment_status, PaymentStatus::Captured);
        let second = place_order(&state, buyer, request(buyer, PaymentMethod::Card, Some("pay_123"))).await.unwrap();

        assert!(second.replayed);
        assert_eq!(first.order.id, second.order.id);
        assert_eq!(store.order_count(), 1);
        assert_eq!(store.items_for_order(first.order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replay_by_another_buyer_is_forbidden() {
        let (state, _, _) = state_with(StubGateway::new());
        let owner = Uuid::new_v4();
        place_order(&state, owner, request(owner, PaymentMethod::Upi, Some("pay_shared"))).await.unwrap();

        let intruder = Uuid::new_v4();
        let err = place_order(&state, intruder, request(intruder, PaymentMethod::Upi, Some("pay_shared")))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::ForeignOrder));
    }

    #[tokio::test]
    async fn concurrent_checkouts_converge_on_one_order() {
        let (state, store, _) = state_with(StubGateway::new());
        let buyer = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_race"))).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().expect("every caller gets an order").order.id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn insert_conflict_refetches_the_winning_order() {
        let store = Arc::new(FaultyStore::default());
        let (state, store, _) = state_with_store(store, StubGateway::new());
        let buyer = Uuid::new_v4();
        let winner = place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_456"))).await.unwrap();

        store.hide_first_lookup.store(true, Ordering::SeqCst);
        let loser = place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_456"))).await.unwrap();

        assert!(loser.replayed);
        assert_eq!(loser.order.id, winner.order.id);
        assert_eq!(store.inner.order_count(), 1);
        assert_eq!(store.inner.items_for_order(winner.order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn interleaved_checkouts_store_one_cart() {
        let store = Arc::new(FaultyStore::default());
        store.slow.store(true, Ordering::SeqCst);
        let (state, store, _) = state_with_store(store, StubGateway::new());
        let buyer = Uuid::new_v4();

        let (a, b) = tokio::join!(
            place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_dup"))),
            place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_dup"))),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.order.id, b.order.id);
        assert!(a.replayed != b.replayed);
        assert_eq!(store.inner.order_count(), 1);
        assert_eq!(store.inner.items_for_order(a.order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gateway_ids_must_be_plain_tokens() {
        let (state, store, _) = state_with(StubGateway::new());
        let buyer = Uuid::new_v4();

        let traversal = request(buyer, PaymentMethod::Upi, Some("pay_mine/../../payments/pay_victim"));
        let err = place_order(&state, buyer, traversal).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Invalid("invalid_payment_id", _)));

        let mut bad_order_id = request(buyer, PaymentMethod::Upi, Some("pay_ok"));
        bad_order_id.gateway_order_id = Some("order_1?x=1".into());
        let err = place_order(&state, buyer, bad_order_id).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Invalid("invalid_gateway_order_id", _)));

        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn item_failure_rolls_back_fresh_order() {
        let store = Arc::new(FaultyStore::default());
        store.fail_items.store(true, Ordering::SeqCst);
        let (state, store, _) = state_with_store(store, StubGateway::new());
        let buyer = Uuid::new_v4();

        let err = place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_789"))).await.unwrap_err();

        assert!(matches!(err, CheckoutError::Items(_)));
        assert_eq!(store.inner.order_count(), 0);
        assert!(store.inner.order_by_payment_id("pay_789").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn item_failure_never_deletes_preexisting_order() {
        let store = Arc::new(FaultyStore::default());
        let (state, store, _) = state_with_store(store, StubGateway::new());
        let buyer = Uuid::new_v4();
        // Pre-existing order without items (e.g. items still in flight from the first writer).
        let existing = store
            .inner
            .insert_order(NewOrder {
                order_number: "ORD-1-1".into(),
                user_id: buyer,
                amount: BigDecimal::from(548),
                payment_method: PaymentMethod::Upi,
                payment_status: PaymentStatus::Captured,
                gateway_order_id: None,
                gateway_payment_id: Some("pay_keep".into()),
                shipping_address: address(),
            })
            .await
            .unwrap();

        store.hide_first_lookup.store(true, Ordering::SeqCst);
        store.fail_items.store(true, Ordering::SeqCst);
        let err = place_order(&state, buyer, request(buyer, PaymentMethod::Upi, Some("pay_keep"))).await.unwrap_err();

        assert!(matches!(err, CheckoutError::Items(_)));
        assert!(store.inner.order_by_id(existing.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_empty_cart_and_bad_quantities() {
        let (state, _, _) = state_with(StubGateway::new());
        let buyer = Uuid::new_v4();

        let mut empty = request(buyer, PaymentMethod::Cod, None);
        empty.items.clear();
        assert!(matches!(place_order(&state, buyer, empty).await, Err(CheckoutError::Invalid("empty_cart", _))));

        let mut zero = request(buyer, PaymentMethod::Cod, None);
        zero.items[0].quantity = 0;
        assert!(matches!(place_order(&state, buyer, zero).await, Err(CheckoutError::Invalid("invalid_quantity", _))));
    }
}
