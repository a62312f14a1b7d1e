use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{OrderStore, StoreError, StoreResult};
use crate::model::{
    NewOrder, NewOrderItem, NewRefund, Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus,
    Refund, RefundStatus, ShippingAddress,
};

const ORDER_PAYMENT_ID_CONSTRAINT: &str = "orders_gateway_payment_id_key";
const REFUND_GATEWAY_ID_CONSTRAINT: &str = "refunds_gateway_refund_id_key";

const ORDER_COLUMNS: &str = "id, order_number, user_id, status, payment_status, amount, payment_method, \
     gateway_order_id, gateway_payment_id, gateway_signature, shipping_address, created_at, updated_at";

const REFUND_COLUMNS: &str =
    "id, order_id, gateway_refund_id, amount, status, reason, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    user_id: Uuid,
    status: String,
    payment_status: String,
    amount: BigDecimal,
    payment_method: Option<String>,
    gateway_order_id: Option<String>,
    gateway_payment_id: Option<String>,
    gateway_signature: Option<String>,
    shipping_address: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> StoreResult<Self> {
        let status = OrderStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("order {} status '{}'", row.id, row.status)))?;
        let payment_status = PaymentStatus::parse(&row.payment_status).ok_or_else(|| {
            StoreError::Corrupt(format!("order {} payment_status '{}'", row.id, row.payment_status))
        })?;
        let payment_method = match row.payment_method.as_deref() {
            Some(raw) => Some(PaymentMethod::parse(raw).ok_or_else(|| {
                StoreError::Corrupt(format!("order {} payment_method '{raw}'", row.id))
            })?),
            None => None,
        };
        let shipping_address: ShippingAddress = serde_json::from_value(row.shipping_address)
            .map_err(|e| StoreError::Corrupt(format!("order {} shipping_address: {e}", row.id)))?;
        Ok(Order {
            id: row.id,
            order_number: row.order_number,
            user_id: row.user_id,
            status,
            payment_status,
            amount: row.amount,
            payment_method,
            gateway_order_id: row.gateway_order_id,
            gateway_payment_id: row.gateway_payment_id,
            gateway_signature: row.gateway_signature,
            shipping_address,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Option<Uuid>,
    product_name: String,
    product_price: BigDecimal,
    quantity: i32,
}

impl From<OrderItemRow> for OrderItem {
    fn from(row: OrderItemRow) -> Self {
        OrderItem {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            product_name: row.product_name,
            product_price: row.product_price,
            quantity: row.quantity,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    order_id: Uuid,
    gateway_refund_id: Option<String>,
    amount: BigDecimal,
    status: String,
    reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = StoreError;

    fn try_from(row: RefundRow) -> StoreResult<Self> {
        let status = RefundStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("refund {} status '{}'", row.id, row.status)))?;
        Ok(Refund {
            id: row.id,
            order_id: row.order_id,
            gateway_refund_id: row.gateway_refund_id,
            amount: row.amount,
            status,
            reason: row.reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Maps a unique violation on one of the idempotency constraints to its typed variant.
fn classify(err: sqlx::Error, payment_id: Option<&str>, refund_id: Option<&str>) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            match db.constraint() {
                Some(ORDER_PAYMENT_ID_CONSTRAINT) => {
                    return StoreError::DuplicatePaymentId(payment_id.unwrap_or_default().to_string())
                }
                Some(REFUND_GATEWAY_ID_CONSTRAINT) => {
                    return StoreError::DuplicateRefundId(refund_id.unwrap_or_default().to_string())
                }
                _ => {}
            }
        }
    }
    StoreError::Database(err)
}

fn orders(rows: Vec<OrderRow>) -> StoreResult<Vec<Order>> {
    rows.into_iter().map(Order::try_from).collect()
}

#[derive(Clone)]
pub struct PgOrderStore {
    db: PgPool,
}

impl PgOrderStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.db).await
    }

    async fn fetch_order(&self, sql: &str, key: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(sql)
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        row.map(Order::try_from).transpose()
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn order_by_id(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn order_by_payment_id(&self, payment_id: &str) -> StoreResult<Option<Order>> {
        self.fetch_order(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE gateway_payment_id = $1"),
            payment_id,
        )
        .await
    }

    async fn order_by_gateway_order_id(&self, gateway_order_id: &str) -> StoreResult<Option<Order>> {
        self.fetch_order(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE gateway_order_id = $1 ORDER BY created_at ASC LIMIT 1"
            ),
            gateway_order_id,
        )
        .await
    }

    async fn insert_order(&self, new: NewOrder) -> StoreResult<Order> {
        let address = serde_json::to_value(&new.shipping_address)
            .map_err(|e| StoreError::Corrupt(format!("shipping_address: {e}")))?;
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"INSERT INTO orders (id, order_number, user_id, status, payment_status, amount, payment_method,
                                  gateway_order_id, gateway_payment_id, shipping_address)
               VALUES ($1, $2, $3, 'created', $4, $5, $6, $7, $8, $9)
               RETURNING {ORDER_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(&new.order_number)
        .bind(new.user_id)
        .bind(new.payment_status.as_str())
        .bind(common_money::normalize_scale(&new.amount))
        .bind(new.payment_method.as_str())
        .bind(new.gateway_order_id.as_deref())
        .bind(new.gateway_payment_id.as_deref())
        .bind(address)
        .fetch_one(&self.db)
        .await
        .map_err(|e| classify(e, new.gateway_payment_id.as_deref(), None))?;
        Order::try_from(row)
    }

    async fn delete_order(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_items_if_absent(
        &self,
        order_id: Uuid,
        items: &[NewOrderItem],
    ) -> StoreResult<Option<Vec<OrderItem>>> {
        // The order row lock serialises competing writers; every line lands or none do.
        let mut tx = self.db.begin().await?;
        let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::Unavailable(format!("order {order_id} does not exist")));
        }
        let present: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM order_items WHERE order_id = $1)")
                .bind(order_id)
                .fetch_one(&mut *tx)
                .await?;
        if present {
            tx.commit().await?;
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let row = sqlx::query_as::<_, OrderItemRow>(
                r#"INSERT INTO order_items (id, order_id, product_id, product_name, product_price, quantity)
                   VALUES ($1, $2, $3, $4, $5, $6)
                   RETURNING id, order_id, product_id, product_name, product_price, quantity"#,
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(&item.product_price)
            .bind(item.quantity)
            .fetch_one(&mut *tx)
            .await?;
            rows.push(OrderItem::from(row));
        }
        tx.commit().await?;
        Ok(Some(rows))
    }

    async fn items_for_order(&self, order_id: Uuid) -> StoreResult<Vec<OrderItem>> {
        let rows = sqlx::query_as::<_, OrderItemRow>(
            r#"SELECT id, order_id, product_id, product_name, product_price, quantity
               FROM order_items WHERE order_id = $1 ORDER BY product_name"#,
        )
        .bind(order_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(OrderItem::from).collect())
    }

    async fn set_payment_status(
        &self,
        id: Uuid,
        status: PaymentStatus,
        signature: Option<&str>,
    ) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"UPDATE orders
               SET payment_status = $2,
                   gateway_signature = COALESCE($3, gateway_signature),
                   updated_at = now()
               WHERE id = $1
               RETURNING {ORDER_COLUMNS}"#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(signature)
        .fetch_optional(&self.db)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn link_payment_id(&self, id: Uuid, payment_id: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"UPDATE orders
               SET gateway_payment_id = COALESCE(gateway_payment_id, $2),
                   updated_at = now()
               WHERE id = $1
               RETURNING {ORDER_COLUMNS}"#
        ))
        .bind(id)
        .bind(payment_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify(e, Some(payment_id), None))?;
        row.map(Order::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: OrderStatus,
        payment_status: Option<PaymentStatus>,
    ) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"UPDATE orders
               SET status = $2,
                   payment_status = COALESCE($3, payment_status),
                   updated_at = now()
               WHERE id = $1
               RETURNING {ORDER_COLUMNS}"#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(payment_status.map(|p| p.as_str()))
        .fetch_optional(&self.db)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn list_orders(&self, user_id: Option<Uuid>) -> StoreResult<Vec<Order>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query_as::<_, OrderRow>(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC"
                ))
                .bind(uid)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, OrderRow>(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC"
                ))
                .fetch_all(&self.db)
                .await?
            }
        };
        orders(rows)
    }

    async fn insert_refund(&self, new: NewRefund) -> StoreResult<Refund> {
        let row = sqlx::query_as::<_, RefundRow>(&format!(
            r#"INSERT INTO refunds (id, order_id, gateway_refund_id, amount, status, reason)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {REFUND_COLUMNS}"#
        ))
        .bind(Uuid::new_v4())
        .bind(new.order_id)
        .bind(new.gateway_refund_id.as_deref())
        .bind(common_money::normalize_scale(&new.amount))
        .bind(new.status.as_str())
        .bind(new.reason.as_deref())
        .fetch_one(&self.db)
        .await
        .map_err(|e| classify(e, None, new.gateway_refund_id.as_deref()))?;
        Refund::try_from(row)
    }

    async fn refund_by_gateway_id(&self, gateway_refund_id: &str) -> StoreResult<Option<Refund>> {
        let row = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE gateway_refund_id = $1"
        ))
        .bind(gateway_refund_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn set_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        gateway_refund_id: Option<&str>,
    ) -> StoreResult<Option<Refund>> {
        let row = sqlx::query_as::<_, RefundRow>(&format!(
            r#"UPDATE refunds
               SET status = $2,
                   gateway_refund_id = COALESCE($3, gateway_refund_id),
                   updated_at = now()
               WHERE id = $1
               RETURNING {REFUND_COLUMNS}"#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(gateway_refund_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify(e, None, gateway_refund_id))?;
        row.map(Refund::try_from).transpose()
    }

    async fn mark_refund_failed(&self, id: Uuid) -> StoreResult<Option<Refund>> {
        let row = sqlx::query_as::<_, RefundRow>(&format!(
            r#"UPDATE refunds
               SET status = $2, updated_at = now()
               WHERE id = $1 AND status = $3
               RETURNING {REFUND_COLUMNS}"#
        ))
        .bind(id)
        .bind(RefundStatus::Failed.as_str())
        .bind(RefundStatus::Initiated.as_str())
        .fetch_optional(&self.db)
        .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn refunds_for_order(&self, order_id: Uuid) -> StoreResult<Vec<Refund>> {
        let rows = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(Refund::try_from).collect()
    }
}
