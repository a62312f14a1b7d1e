use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    NewOrder, NewOrderItem, NewRefund, Order, OrderItem, OrderStatus, PaymentStatus, Refund,
    RefundStatus,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryOrderStore;
pub use postgres::PgOrderStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another order already owns this gateway payment id. Checkout treats this as
    /// "the other writer won the race", not as a failure.
    #[error("an order already exists for gateway payment id {0}")]
    DuplicatePaymentId(String),
    #[error("a refund already exists for gateway refund id {0}")]
    DuplicateRefundId(String),
    #[error("stored row is not valid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for common_http_errors::ApiError {
    fn from(err: StoreError) -> Self {
        common_http_errors::ApiError::internal(err, None)
    }
}

/// Persistence seam for orders, their item snapshots and refunds.
///
/// Every mutation is a set-to-value write so concurrent writers converge; the
/// unique gateway payment id is the only coordination point.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn order_by_id(&self, id: Uuid) -> StoreResult<Option<Order>>;
    async fn order_by_payment_id(&self, payment_id: &str) -> StoreResult<Option<Order>>;
    async fn order_by_gateway_order_id(&self, gateway_order_id: &str) -> StoreResult<Option<Order>>;

    /// Fails with [`StoreError::DuplicatePaymentId`] when the payment id is taken.
    async fn insert_order(&self, order: NewOrder) -> StoreResult<Order>;
    async fn delete_order(&self, id: Uuid) -> StoreResult<()>;

    /// Writes the item snapshot unless the order already has one. Runs under the
    /// order's lock so concurrent checkouts for one payment store a single cart.
    /// Returns `None` when items were already present.
    async fn insert_items_if_absent(
        &self,
        order_id: Uuid,
        items: &[NewOrderItem],
    ) -> StoreResult<Option<Vec<OrderItem>>>;
    async fn items_for_order(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>>;

    /// Overwrites `payment_status`; a provided signature replaces the audit column.
    async fn set_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        signature: Option<&str>,
    ) -> StoreResult<Option<Order>>;

    /// Backfills the gateway payment id only when the order has none yet.
    async fn link_payment_id(&self, id: Uuid, payment_id: &str) -> StoreResult<Option<Order>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) -> StoreResult<Option<Order>>;

    /// Newest first. `None` lists every buyer's orders.
    async fn list_orders(&self, user_id: Option<Uuid>) -> StoreResult<Vec<Order>>;

    /// Fails with [`StoreError::DuplicateRefundId`] when the gateway refund id is taken.
    async fn insert_refund(&self, refund: NewRefund) -> StoreResult<Refund>;
    async fn refund_by_gateway_id(&self, gateway_refund_id: &str) -> StoreResult<Option<Refund>>;
    async fn set_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        gateway_refund_id: Option<&str>,
    ) -> StoreResult<Option<Refund>>;
    /// Moves an `initiated` refund to `failed`. Returns `None` when the refund is
    /// missing or already left `initiated`, e.g. a webhook recorded it as processed.
    async fn mark_refund_failed(&self, id: Uuid) -> StoreResult<Option<Refund>>;
    /// Oldest first.
    async fn refunds_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Refund>>;
}
