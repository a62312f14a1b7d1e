mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use common::{checkout_body, harness, send, token, Harness};
use storefront_service::gateway::StubGateway;
use storefront_service::model::{OrderStatus, PaymentStatus};
use storefront_service::store::OrderStore;

async fn placed(h: &Harness, method: &str, payment_id: Option<&str>) -> (Uuid, Uuid) {
    let buyer = Uuid::new_v4();
    let resp = send(
        &h.app,
        Method::POST,
        "/orders",
        Some(&token(buyer, &["customer"])),
        Some(checkout_body(buyer, method, payment_id)),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED);
    (buyer, resp.body["orderId"].as_str().unwrap().parse().unwrap())
}

fn admin() -> String {
    token(Uuid::new_v4(), &["admin"])
}

#[tokio::test]
async fn status_update_requires_admin_role() {
    let h = harness(StubGateway::new()).await;
    let (buyer, order_id) = placed(&h, "cod", None).await;

    let resp = send(
        &h.app,
        Method::PATCH,
        &format!("/admin/orders/{order_id}/status"),
        Some(&token(buyer, &["customer"])),
        Some(json!({ "status": "shipped" })),
    )
    .await;

    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert_eq!(resp.body["code"], "missing_role");
    assert_eq!(resp.body["missing_role"], "admin");
    let order = h.store.order_by_id(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Created);
}

#[tokio::test]
async fn admin_overwrites_status_and_payment_status() {
    let h = harness(StubGateway::new()).await;
    let (_, order_id) = placed(&h, "cod", None).await;

    let resp = send(
        &h.app,
        Method::PATCH,
        &format!("/admin/orders/{order_id}/status"),
        Some(&admin()),
        Some(json!({ "status": "delivered", "paymentStatus": "captured" })),
    )
    .await;

    assert_eq!(resp.status, StatusCode::OK, "{:?}", resp.body);
    assert_eq!(resp.body["order"]["status"], "delivered");
    assert_eq!(resp.body["order"]["paymentStatus"], "captured");
    let order = h.store.order_by_id(order_id).await.unwrap().unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Captured);
}

#[tokio::test]
async fn invalid_status_values_are_rejected() {
    let h = harness(StubGateway::new()).await;
    let (_, order_id) = placed(&h, "cod", None).await;
    let uri = format!("/admin/orders/{order_id}/status");

    let bad_status = send(&h.app, Method::PATCH, &uri, Some(&admin()), Some(json!({ "status": "teleported" }))).await;
    assert_eq!(bad_status.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_status.error_code(), Some("invalid_status"));

    let bad_payment = send(
        &h.app,
        Method::PATCH,
        &uri,
        Some(&admin()),
        Some(json!({ "status": "shipped", "paymentStatus": "settled" })),
    )
    .await;
    assert_eq!(bad_payment.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad_payment.error_code(), Some("invalid_payment_status"));

    let missing = send(
        &h.app,
        Method::PATCH,
        &format!("/admin/orders/{}/status", Uuid::new_v4()),
        Some(&admin()),
        Some(json!({ "status": "shipped" })),
    )
    .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_lists_every_buyers_orders() {
    let h = harness(StubGateway::new()).await;
    placed(&h, "cod", None).await;
    placed(&h, "upi", Some("pay_l")).await;

    let resp = send(&h.app, Method::GET, "/admin/orders", Some(&admin()), None).await;
    assert_eq!(resp.status, StatusCode::OK);
    let orders = resp.body.as_array().unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o["items"].as_array().unwrap().len() == 2));

    let denied = send(&h.app, Method::GET, "/admin/orders", Some(&token(Uuid::new_v4(), &["customer"])), None).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn partial_then_full_refund() {
    let h = harness(StubGateway::new().with_captured_payment("pay_a", 54_800)).await;
    let (_, order_id) = placed(&h, "upi", Some("pay_a")).await;
    let uri = format!("/admin/orders/{order_id}/refunds");

    let partial = send(&h.app, Method::POST, &uri, Some(&admin()), Some(json!({ "amount": "100.00", "reason": "damaged item" }))).await;
    assert_eq!(partial.status, StatusCode::CREATED, "{:?}", partial.body);
    assert_eq!(partial.body["fullyRefunded"], false);
    assert_eq!(partial.body["strategy"], "instant");
    assert_eq!(partial.body["order"]["paymentStatus"], "partially_refunded");
    assert_eq!(partial.body["message"], "Partial refund processed successfully");

    let too_much = send(&h.app, Method::POST, &uri, Some(&admin()), Some(json!({ "amount": "500.00" }))).await;
    assert_eq!(too_much.status, StatusCode::BAD_REQUEST);
    assert_eq!(too_much.error_code(), Some("amount_exceeds_remaining"));

    let rest = send(&h.app, Method::POST, &uri, Some(&admin()), None).await;
    assert_eq!(rest.status, StatusCode::CREATED, "{:?}", rest.body);
    assert_eq!(rest.body["fullyRefunded"], true);
    assert_eq!(rest.body["order"]["paymentStatus"], "refunded");

    let done = send(&h.app, Method::POST, &uri, Some(&admin()), None).await;
    assert_eq!(done.status, StatusCode::BAD_REQUEST);
    assert_eq!(done.error_code(), Some("already_refunded"));
    assert_eq!(h.gateway.refund_calls().len(), 2);
}

#[tokio::test]
async fn refund_requires_gateway_payment() {
    let h = harness(StubGateway::new()).await;
    let (_, order_id) = placed(&h, "cod", None).await;
    let resp = send(&h.app, Method::POST, &format!("/admin/orders/{order_id}/refunds"), Some(&admin()), None).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.error_code(), Some("no_payment_id"));
}

#[tokio::test]
async fn exhausted_refund_strategies_surface_as_bad_gateway() {
    let gateway = StubGateway::new();
    let h = harness(gateway).await;
    let (_, order_id) = placed(&h, "upi", Some("pay_gone")).await;
    let resp = send(&h.app, Method::POST, &format!("/admin/orders/{order_id}/refunds"), Some(&admin()), None).await;
    assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
    assert_eq!(resp.error_code(), Some("refund_failed"));
    let refunds = h.store.refunds_for_order(order_id).await.unwrap();
    assert_eq!(refunds.len(), 1);
}

#[tokio::test]
async fn admin_cancel_bypasses_ownership() {
    let h = harness(StubGateway::new()).await;
    let (_, order_id) = placed(&h, "cod", None).await;

    let resp = send(&h.app, Method::POST, &format!("/admin/orders/{order_id}/cancel"), Some(&admin()), None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["order"]["status"], "cancelled");
}

#[tokio::test]
async fn payment_order_is_created_in_minor_units() {
    let h = harness(StubGateway::new()).await;
    let buyer = token(Uuid::new_v4(), &["customer"]);

    let resp = send(&h.app, Method::POST, "/payments/orders", Some(&buyer), Some(json!({ "amount": "499.50" }))).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    assert_eq!(resp.body["amount"], 49_950);
    assert_eq!(resp.body["currency"], "INR");
    assert!(resp.body["id"].as_str().unwrap().starts_with("order_stub_"));

    let zero = send(&h.app, Method::POST, "/payments/orders", Some(&buyer), Some(json!({ "amount": "0" }))).await;
    assert_eq!(zero.status, StatusCode::BAD_REQUEST);

    let anonymous = send(&h.app, Method::POST, "/payments/orders", None, Some(json!({ "amount": "10" }))).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
}
