use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use common_auth::{JwtConfig, JwtVerifier};
use common_crypto::WebhookSecret;
use uuid::Uuid;

use crate::app::AppState;
use crate::config::StorefrontConfig;
use crate::gateway::StubGateway;
use crate::model::{
    NewOrder, NewOrderItem, NewRefund, Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus,
    Refund, RefundStatus, ShippingAddress,
};
use crate::store::{InMemoryOrderStore, OrderStore, StoreError, StoreResult};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test";

pub fn address() -> ShippingAddress {
    ShippingAddress {
        name: "Asha Rao".into(),
        phone: Some("9999999999".into()),
        address_line1: "12 MG Road".into(),
        address_line2: None,
        city: "Pune".into(),
        state: "MH".into(),
        pincode: "411001".into(),
    }
}

pub fn state_with(gateway: StubGateway) -> (AppState, Arc<InMemoryOrderStore>, Arc<StubGateway>) {
    state_with_store(Arc::new(InMemoryOrderStore::new()), gateway)
}

pub fn state_with_store<S: OrderStore + 'static>(
    store: Arc<S>,
    gateway: StubGateway,
) -> (AppState, Arc<S>, Arc<StubGateway>) {
    let gateway = Arc::new(gateway);
    let secret = WebhookSecret::new(TEST_WEBHOOK_SECRET).expect("secret");
    let verifier = Arc::new(JwtVerifier::new(JwtConfig::new("test-idp", "storefront")));
    let state = AppState::new(store.clone(), gateway.clone(), verifier, StorefrontConfig::new(secret));
    (state, store, gateway)
}

pub async fn new_paid_order(store: &InMemoryOrderStore, payment_id: &str, amount: &str) -> Order {
    store
        .insert_order(NewOrder {
            order_number: "ORD-0-0".into(),
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from_str(amount).expect("amount"),
            payment_method: PaymentMethod::Upi,
            payment_status: PaymentStatus::Captured,
            gateway_order_id: Some(format!("order_for_{payment_id}")),
            gateway_payment_id: Some(payment_id.to_string()),
            shipping_address: address(),
        })
        .await
        .expect("insert order")
}

/// Gateway refund id written when [`FaultyStore::settle_before_fail`] fires.
pub const WEBHOOK_REFUND_ID: &str = "rfnd_from_webhook";

/// In-memory store with switchable faults for the interleavings checkout and
/// cancellation must survive.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: InMemoryOrderStore,
    /// Hide existing orders from the next payment-id lookup, as if another
    /// writer committed between the lookup and the insert.
    pub hide_first_lookup: AtomicBool,
    pub fail_items: AtomicBool,
    /// Yield to the scheduler around payment-id lookups and item writes.
    pub slow: AtomicBool,
    /// Record the refund as processed, as the refund webhook would, right
    /// before it is marked failed.
    pub settle_before_fail: AtomicBool,
}

impl FaultyStore {
    async fn pause(&self) {
        if self.slow.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl OrderStore for FaultyStore {
    async fn order_by_id(&self, id: Uuid) -> StoreResult<Option<Order>> { self.inner.order_by_id(id).await }
    async fn order_by_payment_id(&self, payment_id: &str) -> StoreResult<Option<Order>> {
        if self.hide_first_lookup.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let found = self.inner.order_by_payment_id(payment_id).await;
        self.pause().await;
        found
    }
    async fn order_by_gateway_order_id(&self, id: &str) -> StoreResult<Option<Order>> { self.inner.order_by_gateway_order_id(id).await }
    async fn insert_order(&self, order: NewOrder) -> StoreResult<Order> { self.inner.insert_order(order).await }
    async fn delete_order(&self, id: Uuid) -> StoreResult<()> { self.inner.delete_order(id).await }
    async fn insert_items_if_absent(&self, order_id: Uuid, items: &[NewOrderItem]) -> StoreResult<Option<Vec<OrderItem>>> {
        self.pause().await;
        if self.fail_items.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("order_items insert refused".into()));
        }
        self.inner.insert_items_if_absent(order_id, items).await
    }
    async fn items_for_order(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>> { self.inner.items_for_order(order_id).await }
    async fn set_payment_status(&self, id: Uuid, status: PaymentStatus, sig: Option<&str>) -> StoreResult<Option<Order>> {
        self.inner.set_payment_status(id, status, sig).await
    }
    async fn link_payment_id(&self, id: Uuid, payment_id: &str) -> StoreResult<Option<Order>> { self.inner.link_payment_id(id, payment_id).await }
    async fn update_status(&self, id: Uuid, status: OrderStatus, ps: Option<PaymentStatus>) -> StoreResult<Option<Order>> {
        self.inner.update_status(id, status, ps).await
    }
    async fn list_orders(&self, user_id: Option<Uuid>) -> StoreResult<Vec<Order>> { self.inner.list_orders(user_id).await }
    async fn insert_refund(&self, refund: NewRefund) -> StoreResult<Refund> { self.inner.insert_refund(refund).await }
    async fn refund_by_gateway_id(&self, id: &str) -> StoreResult<Option<Refund>> { self.inner.refund_by_gateway_id(id).await }
    async fn set_refund_status(&self, id: Uuid, status: RefundStatus, gid: Option<&str>) -> StoreResult<Option<Refund>> {
        self.inner.set_refund_status(id, status, gid).await
    }
    async fn mark_refund_failed(&self, id: Uuid) -> StoreResult<Option<Refund>> {
        if self.settle_before_fail.swap(false, Ordering::SeqCst) {
            self.inner
                .set_refund_status(id, RefundStatus::Processed, Some(WEBHOOK_REFUND_ID))
                .await?;
        }
        self.inner.mark_refund_failed(id).await
    }
    async fn refunds_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Refund>> { self.inner.refunds_for_order(order_id).await }
}
