use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{OrderStore, StoreError, StoreResult};
use crate::model::{
    NewOrder, NewOrderItem, NewRefund, Order, OrderItem, OrderStatus, PaymentStatus, Refund,
    RefundStatus,
};

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    items: HashMap<Uuid, Vec<OrderItem>>,
    refunds: Vec<Refund>,
}

/// Process-local store with the same uniqueness rules as the Postgres schema.
/// Used for local development without a database and throughout the tests.
#[derive(Default)]
pub struct InMemoryOrderStore {
    tables: Mutex<Tables>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rewrites an order's creation time; fixtures use it to age orders.
    pub fn set_created_at(&self, id: Uuid, created_at: DateTime<Utc>) -> bool {
        match self.tables().orders.get_mut(&id) {
            Some(order) => {
                order.created_at = created_at;
                true
            }
            None => false,
        }
    }

    pub fn order_count(&self) -> usize {
        self.tables().orders.len()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn order_by_id(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.tables().orders.get(&id).cloned())
    }

    async fn order_by_payment_id(&self, payment_id: &str) -> StoreResult<Option<Order>> {
        Ok(self
            .tables()
            .orders
            .values()
            .find(|o| o.gateway_payment_id.as_deref() == Some(payment_id))
            .cloned())
    }

    async fn order_by_gateway_order_id(&self, gateway_order_id: &str) -> StoreResult<Option<Order>> {
        let tables = self.tables();
        let mut matches: Vec<&Order> = tables
            .orders
            .values()
            .filter(|o| o.gateway_order_id.as_deref() == Some(gateway_order_id))
            .collect();
        matches.sort_by_key(|o| o.created_at);
        Ok(matches.first().map(|o| (*o).clone()))
    }

    async fn insert_order(&self, new: NewOrder) -> StoreResult<Order> {
        let mut tables = self.tables();
        if let Some(payment_id) = new.gateway_payment_id.as_deref() {
            let taken = tables
                .orders
                .values()
                .any(|o| o.gateway_payment_id.as_deref() == Some(payment_id));
            if taken {
                return Err(StoreError::DuplicatePaymentId(payment_id.to_string()));
            }
        }
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            order_number: new.order_number,
            user_id: new.user_id,
            status: OrderStatus::Created,
            payment_status: new.payment_status,
            amount: common_money::normalize_scale(&new.amount),
            payment_method: Some(new.payment_method),
            gateway_order_id: new.gateway_order_id,
            gateway_payment_id: new.gateway_payment_id,
            gateway_signature: None,
            shipping_address: new.shipping_address,
            created_at: now,
            updated_at: now,
        };
        tables.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn delete_order(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.tables();
        tables.orders.remove(&id);
        tables.items.remove(&id);
        tables.refunds.retain(|r| r.order_id != id);
        Ok(())
    }

    async fn insert_items_if_absent(
        &self,
        order_id: Uuid,
        items: &[NewOrderItem],
    ) -> StoreResult<Option<Vec<OrderItem>>> {
        let mut tables = self.tables();
        if !tables.orders.contains_key(&order_id) {
            return Err(StoreError::Unavailable(format!("order {order_id} does not exist")));
        }
        if tables.items.get(&order_id).is_some_and(|existing| !existing.is_empty()) {
            return Ok(None);
        }
        let rows: Vec<OrderItem> = items
            .iter()
            .map(|item| OrderItem {
                id: Uuid::new_v4(),
                order_id,
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                product_price: item.product_price.clone(),
                quantity: item.quantity,
            })
            .collect();
        tables.items.insert(order_id, rows.clone());
        Ok(Some(rows))
    }

    async fn items_for_order(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>> {
        Ok(self.tables().items.get(&order_id).cloned().unwrap_or_default())
    }

    async fn set_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        signature: Option<&str>,
    ) -> StoreResult<Option<Order>> {
        let mut tables = self.tables();
        Ok(tables.orders.get_mut(&id).map(|order| {
            order.payment_status = status;
            if let Some(sig) = signature {
                order.gateway_signature = Some(sig.to_string());
            }
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn link_payment_id(&self, id: Uuid, payment_id: &str) -> StoreResult<Option<Order>> {
        let mut tables = self.tables();
        let owned_elsewhere = tables
            .orders
            .values()
            .any(|o| o.id != id && o.gateway_payment_id.as_deref() == Some(payment_id));
        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(None);
        };
        if order.gateway_payment_id.is_none() {
            if owned_elsewhere {
                return Err(StoreError::DuplicatePaymentId(payment_id.to_string()));
            }
            order.gateway_payment_id = Some(payment_id.to_string());
            order.updated_at = Utc::now();
        }
        Ok(Some(order.clone()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) -> StoreResult<Option<Order>> {
        let mut tables = self.tables();
        Ok(tables.orders.get_mut(&id).map(|order| {
            order.status = status;
            if let Some(ps) = payment_status {
                order.payment_status = ps;
            }
            order.updated_at = Utc::now();
            order.clone()
        }))
    }

    async fn list_orders(&self, user_id: Option<Uuid>) -> StoreResult<Vec<Order>> {
        let tables = self.tables();
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| user_id.map_or(true, |uid| o.user_id == uid))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn insert_refund(&self, new: NewRefund) -> StoreResult<Refund> {
        let mut tables = self.tables();
        if !tables.orders.contains_key(&new.order_id) {
            return Err(StoreError::Unavailable(format!("order {} does not exist", new.order_id)));
        }
        if let Some(gateway_id) = new.gateway_refund_id.as_deref() {
            if tables.refunds.iter().any(|r| r.gateway_refund_id.as_deref() == Some(gateway_id)) {
                return Err(StoreError::DuplicateRefundId(gateway_id.to_string()));
            }
        }
        let now = Utc::now();
        let refund = Refund {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            gateway_refund_id: new.gateway_refund_id,
            amount: common_money::normalize_scale(&new.amount),
            status: new.status,
            reason: new.reason,
            created_at: now,
            updated_at: now,
        };
        tables.refunds.push(refund.clone());
        Ok(refund)
    }

    async fn refund_by_gateway_id(&self, gateway_refund_id: &str) -> StoreResult<Option<Refund>> {
        Ok(self
            .tables()
            .refunds
            .iter()
            .find(|r| r.gateway_refund_id.as_deref() == Some(gateway_refund_id))
            .cloned())
    }

    async fn set_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        gateway_refund_id: Option<&str>,
    ) -> StoreResult<Option<Refund>> {
        let mut tables = self.tables();
        if let Some(gateway_id) = gateway_refund_id {
            let taken = tables
                .refunds
                .iter()
                .any(|r| r.id != id && r.gateway_refund_id.as_deref() == Some(gateway_id));
            if taken {
                return Err(StoreError::DuplicateRefundId(gateway_id.to_string()));
            }
        }
        Ok(tables.refunds.iter_mut().find(|r| r.id == id).map(|refund| {
            refund.status = status;
            if let Some(gateway_id) = gateway_refund_id {
                refund.gateway_refund_id = Some(gateway_id.to_string());
            }
            refund.updated_at = Utc::now();
            refund.clone()
        }))
    }

    async fn mark_refund_failed(&self, id: Uuid) -> StoreResult<Option<Refund>> {
        let mut tables = self.tables();
        Ok(tables
            .refunds
            .iter_mut()
            .find(|r| r.id == id && r.status == RefundStatus::Initiated)
            .map(|refund| {
                refund.status = RefundStatus::Failed;
                refund.updated_at = Utc::now();
                refund.clone()
            }))
    }

    async fn refunds_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Refund>> {
        Ok(self
            .tables()
            .refunds
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }
}
