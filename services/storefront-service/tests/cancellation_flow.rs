mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use common::{checkout_body, harness, harness_with, send, token, Harness};
use storefront_service::gateway::{RefundMode, StubGateway};
use storefront_service::model::{OrderStatus, PaymentStatus, RefundStatus};
use storefront_service::store::OrderStore;

async fn placed(h: &Harness, buyer: Uuid, method: &str, payment_id: Option<&str>) -> Uuid {
    let resp = send(
        &h.app,
        Method::POST,
        "/orders",
        Some(&token(buyer, &[])),
        Some(checkout_body(buyer, method, payment_id)),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{:?}", resp.body);
    resp.body["orderId"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn buyer_cancellation_refunds_captured_payment() {
    let h = harness(StubGateway::new().with_captured_payment("pay_d", 54_800)).await;
    let buyer = Uuid::new_v4();
    let order_id = placed(&h, buyer, "upi", Some("pay_d")).await;
    h.store.set_created_at(order_id, Utc::now() - Duration::hours(2));

    let resp = send(
        &h.app,
        Method::POST,
        &format!("/orders/{order_id}/cancel"),
        Some(&token(buyer, &[])),
        Some(json!({ "reason": "ordered twice" })),
    )
    .await;

    assert_eq!(resp.status, StatusCode::OK, "{:?}", resp.body);
    assert_eq!(resp.body["status"], "cancelled");
    assert_eq!(resp.body["refundProcessed"], true);
    assert_eq!(resp.body["sandbox"], false);
    assert_eq!(resp.body["order"]["paymentStatus"], "refunded");

    let refunds = h.store.refunds_for_order(order_id).await.unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].status, RefundStatus::Processed);
    assert_eq!(refunds[0].reason.as_deref(), Some("ordered twice"));
    assert_eq!(h.gateway.refund_calls(), vec![("pay_d".to_string(), 54_800, RefundMode::Instant)]);
}

#[tokio::test]
async fn missing_gateway_payment_cancels_without_refund() {
    let h = harness(StubGateway::new()).await;
    let buyer = Uuid::new_v4();
    let order_id = placed(&h, buyer, "upi", Some("pay_e")).await;

    let resp = send(&h.app, Method::POST, &format!("/orders/{order_id}/cancel"), Some(&token(buyer, &[])), None).await;

    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["refundProcessed"], false);
    let order = h.store.order_by_id(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Captured);
    assert!(h.store.refunds_for_order(order_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn sandbox_rejection_is_reported_as_pending() {
    let gateway = StubGateway::new().with_captured_payment("pay_s", 54_800);
    for mode in [RefundMode::Instant, RefundMode::Normal, RefundMode::AlternateTransport] {
        gateway.reject_mode(mode);
    }
    let h = harness_with(gateway, |cfg| cfg.sandbox = true).await;
    let buyer = Uuid::new_v4();
    let order_id = placed(&h, buyer, "upi", Some("pay_s")).await;

    let resp = send(&h.app, Method::POST, &format!("/orders/{order_id}/cancel"), Some(&token(buyer, &[])), None).await;

    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["refundProcessed"], false);
    assert_eq!(resp.body["sandbox"], true);
    assert!(resp.body["message"].as_str().unwrap().contains("Refund has been initiated"));
    assert_eq!(h.gateway.refund_calls().len(), 3);
}

#[tokio::test]
async fn ineligible_cancellations_are_rejected() {
    let h = harness(StubGateway::new()).await;
    let buyer = Uuid::new_v4();
    let bearer = token(buyer, &[]);

    let order_id = placed(&h, buyer, "cod", None).await;
    let stranger = send(&h.app, Method::POST, &format!("/orders/{order_id}/cancel"), Some(&token(Uuid::new_v4(), &[])), None).await;
    assert_eq!(stranger.status, StatusCode::FORBIDDEN);
    assert_eq!(stranger.error_code(), Some("not_order_owner"));

    let first = send(&h.app, Method::POST, &format!("/orders/{order_id}/cancel"), Some(&bearer), None).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["message"], "Order cancelled successfully.");
    let again = send(&h.app, Method::POST, &format!("/orders/{order_id}/cancel"), Some(&bearer), None).await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);
    assert_eq!(again.error_code(), Some("already_cancelled"));

    let stale = placed(&h, buyer, "cod", None).await;
    h.store.set_created_at(stale, Utc::now() - Duration::minutes(6 * 60 + 1));
    let expired = send(&h.app, Method::POST, &format!("/orders/{stale}/cancel"), Some(&bearer), None).await;
    assert_eq!(expired.status, StatusCode::BAD_REQUEST);
    assert_eq!(expired.error_code(), Some("cancellation_window_expired"));
    assert!(expired.body["message"].as_str().unwrap().contains("contact support"));

    let missing = send(&h.app, Method::POST, &format!("/orders/{}/cancel", Uuid::new_v4()), Some(&bearer), None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delivered_orders_cannot_be_cancelled() {
    let h = harness(StubGateway::new()).await;
    let buyer = Uuid::new_v4();
    let order_id = placed(&h, buyer, "cod", None).await;
    h.store.update_status(order_id, OrderStatus::Delivered, None).await.unwrap();

    let resp = send(&h.app, Method::POST, &format!("/orders/{order_id}/cancel"), Some(&token(buyer, &[])), None).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.error_code(), Some("cannot_cancel_delivered"));
}

#[tokio::test]
async fn cancellation_requires_a_session() {
    let h = harness(StubGateway::new()).await;
    let resp = send(&h.app, Method::POST, &format!("/orders/{}/cancel", Uuid::new_v4()), None, None).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}
