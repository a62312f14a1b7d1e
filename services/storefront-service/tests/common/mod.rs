#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use common_auth::{JwtConfig, JwtVerifier};
use common_crypto::WebhookSecret;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use storefront_service::gateway::StubGateway;
use storefront_service::store::InMemoryOrderStore;
use storefront_service::{build_router, AppState, StorefrontConfig};

pub const JWT_SECRET: &[u8] = b"storefront-test-secret";
pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub struct Harness {
    pub app: Router,
    pub store: Arc<InMemoryOrderStore>,
    pub gateway: Arc<StubGateway>,
}

pub async fn harness(gateway: StubGateway) -> Harness {
    harness_with(gateway, |_| {}).await
}

pub async fn harness_with(gateway: StubGateway, tweak: impl FnOnce(&mut StorefrontConfig)) -> Harness {
    let store = Arc::new(InMemoryOrderStore::new());
    let gateway = Arc::new(gateway);
    let verifier = JwtVerifier::builder(JwtConfig::new("test-idp", "storefront"))
        .with_hmac_secret(JWT_SECRET)
        .build()
        .await
        .expect("verifier");
    let mut config = StorefrontConfig::new(WebhookSecret::new(WEBHOOK_SECRET).expect("secret"));
    tweak(&mut config);
    let state = AppState::new(store.clone(), gateway.clone(), Arc::new(verifier), config);
    Harness { app: build_router(state), store, gateway }
}

pub fn token(subject: Uuid, roles: &[&str]) -> String {
    let now = Utc::now().timestamp();
    encode(
        &Header::new(Algorithm::HS256),
        &json!({
            "sub": subject.to_string(),
            "iss": "test-idp",
            "aud": "storefront",
            "exp": now + 600,
            "iat": now,
            "roles": roles,
        }),
        &EncodingKey::from_secret(JWT_SECRET),
    )
    .expect("sign token")
}

pub fn sign(body: &[u8]) -> String {
    WebhookSecret::new(WEBHOOK_SECRET).expect("secret").sign_hex(body)
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    pub fn error_code(&self) -> Option<&str> {
        self.headers.get("X-Error-Code").and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &Router, method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).expect("json"))
        }
        None => Body::empty(),
    };
    read(app.clone().oneshot(builder.body(body).expect("request")).await.expect("response")).await
}

pub async fn webhook(app: &Router, raw: &[u8], signature: Option<&str>) -> Reply {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/payment")
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        builder = builder.header("x-signature", sig);
    }
    let req = builder.body(Body::from(raw.to_vec())).expect("request");
    read(app.clone().oneshot(req).await.expect("response")).await
}

async fn read(resp: axum::response::Response) -> Reply {
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Reply { status, headers, body }
}

pub fn checkout_body(buyer: Uuid, method: &str, payment_id: Option<&str>) -> Value {
    json!({
        "buyerId": buyer,
        "items": [
            { "name": "Brass Lamp", "price": "450.00", "quantity": 1 },
            { "name": "Cotton Runner", "price": "49.00", "quantity": 2 }
        ],
        "shippingAddress": {
            "name": "Asha Rao",
            "phone": "9999999999",
            "addressLine1": "12 MG Road",
            "city": "Pune",
            "state": "MH",
            "pincode": "411001"
        },
        "amount": "548.00",
        "paymentMethod": method,
        "gatewayOrderId": payment_id.map(|p| format!("order_{p}")),
        "gatewayPaymentId": payment_id,
    })
}

pub fn event(name: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "event": name, "payload": payload })).expect("json")
}

pub fn payment_event(name: &str, payment_id: &str, order_id: Option<&str>, amount: i64) -> Vec<u8> {
    event(
        name,
        json!({ "payment": { "entity": { "id": payment_id, "order_id": order_id, "amount": amount, "notes": [] } } }),
    )
}

pub fn refund_event(refund_id: &str, payment_id: &str, amount: i64) -> Vec<u8> {
    event(
        "refund.processed",
        json!({ "refund": { "entity": { "id": refund_id, "payment_id": payment_id, "amount": amount } } }),
    )
}
