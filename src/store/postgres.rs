//! PostgreSQL store
//!
//! Stock decrements are single conditional `UPDATE`s. The order-scoped commit
//! runs in one transaction together with an insert into `order_stock_commits`,
//! whose primary key makes a second commit for the same order a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{stock_deltas, CartStore, CatalogStore, DeliveryStore, OrderQuery, OrderRepository, StoreError, StoreResult};
use crate::domain::aggregates::{
    Availability, Cart, CartItem, Delivery, DeliveryStatus, GatewayDetails, Order, OrderItem, OrderStatus, PaymentMethod, RefundStatus,
    StockRecord,
};
use crate::domain::value_objects::Address;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub fn pool(&self) -> &PgPool { &self.pool }

    /// Tells a failed conditional decrement apart: missing or unsellable record vs. not enough stock.
    async fn decrement_failure(tx: &mut Transaction<'_, Postgres>, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<StoreError> {
        let sellable: Option<(bool,)> = sqlx::query_as(
            "SELECT is_available AND NOT is_deleted FROM pharmacy_medicines WHERE medicine_id = $1 AND pharmacy_id = $2",
        )
        .bind(medicine_id)
        .bind(pharmacy_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(match sellable {
            Some((true,)) => StoreError::InsufficientStock { medicine_id, pharmacy_id },
            _ => StoreError::Unavailable { medicine_id, pharmacy_id },
        })
    }

    /// Copies the current stock into the pharmacy's inventory sheet, if it keeps one.
    async fn sync_stock_record(tx: &mut Transaction<'_, Postgres>, medicine_id: Uuid, pharmacy_id: Uuid, restocked: bool) -> StoreResult<()> {
        let row: Option<(i32, i32)> = sqlx::query_as(
            "UPDATE stock_records s SET quantity = pm.stock, updated_at = NOW(),
                last_restocked = CASE WHEN $3 THEN NOW() ELSE s.last_restocked END
             FROM pharmacy_medicines pm
             WHERE pm.medicine_id = s.medicine_id AND pm.pharmacy_id = s.pharmacy_id
               AND s.medicine_id = $1 AND s.pharmacy_id = $2
             RETURNING s.quantity, s.reorder_level",
        )
        .bind(medicine_id)
        .bind(pharmacy_id)
        .bind(restocked)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some((quantity, reorder_level)) = row {
            if quantity <= reorder_level {
                tracing::warn!(%medicine_id, %pharmacy_id, quantity, reorder_level, "Stock at reorder level");
            }
        }
        Ok(())
    }
}

fn stock_param(quantity: u64) -> StoreResult<i32> {
    i32::try_from(quantity).map_err(|_| StoreError::Corrupt(format!("quantity {quantity} out of range")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().and_then(|d| d.code()).as_deref() == Some("23505")
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_availability(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<Availability>> {
        let row: Option<(Decimal, i32, bool)> = sqlx::query_as(
            "SELECT price, stock, is_available AND NOT is_deleted FROM pharmacy_medicines WHERE medicine_id = $1 AND pharmacy_id = $2",
        )
        .bind(medicine_id)
        .bind(pharmacy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(price, stock, is_available)| Availability { price, stock: stock.max(0) as u32, is_available }))
    }

    async fn adjust_stock(&self, medicine_id: Uuid, pharmacy_id: Uuid, delta: i64) -> StoreResult<u32> {
        let mut tx = self.pool.begin().await?;
        let amount = stock_param(delta.unsigned_abs())?;
        let sql = if delta < 0 {
            "UPDATE pharmacy_medicines SET stock = stock - $3, updated_at = NOW()
             WHERE medicine_id = $1 AND pharmacy_id = $2 AND is_available AND NOT is_deleted AND stock >= $3
             RETURNING stock"
        } else {
            "UPDATE pharmacy_medicines SET stock = stock + $3, updated_at = NOW()
             WHERE medicine_id = $1 AND pharmacy_id = $2
             RETURNING stock"
        };
        let row: Option<(i32,)> = sqlx::query_as(sql)
            .bind(medicine_id)
            .bind(pharmacy_id)
            .bind(amount)
            .fetch_optional(&mut *tx)
            .await?;
        match row {
            Some((stock,)) => {
                Self::sync_stock_record(&mut tx, medicine_id, pharmacy_id, delta > 0).await?;
                tx.commit().await?;
                Ok(stock.max(0) as u32)
            }
            None if delta < 0 => Err(Self::decrement_failure(&mut tx, medicine_id, pharmacy_id).await?),
            None => Err(StoreError::Unavailable { medicine_id, pharmacy_id }),
        }
    }

    async fn commit_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query("INSERT INTO order_stock_commits (order_id) VALUES ($1) ON CONFLICT (order_id) DO NOTHING")
            .bind(order_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if claimed == 0 {
            return Ok(false);
        }
        for ((medicine_id, pharmacy_id), quantity) in stock_deltas(items) {
            let updated = sqlx::query(
                "UPDATE pharmacy_medicines SET stock = stock - $3, updated_at = NOW()
                 WHERE medicine_id = $1 AND pharmacy_id = $2 AND is_available AND NOT is_deleted AND stock >= $3",
            )
            .bind(medicine_id)
            .bind(pharmacy_id)
            .bind(stock_param(u64::from(quantity))?)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                // dropping the transaction rolls back the decrements already applied
                return Err(Self::decrement_failure(&mut tx, medicine_id, pharmacy_id).await?);
            }
            Self::sync_stock_record(&mut tx, medicine_id, pharmacy_id, false).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn release_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let released = sqlx::query("DELETE FROM order_stock_commits WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if released == 0 {
            return Ok(false);
        }
        for ((medicine_id, pharmacy_id), quantity) in stock_deltas(items) {
            let updated = sqlx::query(
                "UPDATE pharmacy_medicines SET stock = stock + $3, updated_at = NOW() WHERE medicine_id = $1 AND pharmacy_id = $2",
            )
            .bind(medicine_id)
            .bind(pharmacy_id)
            .bind(stock_param(u64::from(quantity))?)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                tracing::warn!(%order_id, %medicine_id, %pharmacy_id, "Stock record vanished, cannot restore");
            }
            Self::sync_stock_record(&mut tx, medicine_id, pharmacy_id, false).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn find_stock_record(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<StockRecord>> {
        let row: Option<(i32, i32, Option<DateTime<Utc>>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT quantity, reorder_level, last_restocked, updated_at FROM stock_records WHERE medicine_id = $1 AND pharmacy_id = $2",
        )
        .bind(medicine_id)
        .bind(pharmacy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(quantity, reorder_level, last_restocked, updated_at)| StockRecord {
            pharmacy_id,
            medicine_id,
            quantity: quantity.max(0) as u32,
            reorder_level: reorder_level.max(0) as u32,
            last_restocked,
            updated_at,
        }))
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    items: Json<Vec<OrderItem>>,
    subtotal: Decimal,
    delivery_fee: Decimal,
    total: Decimal,
    status: String,
    payment_method: String,
    address: Json<Address>,
    is_paid: bool,
    paid_at: Option<DateTime<Utc>>,
    stock_committed: bool,
    cart_cleared: bool,
    gateway: Option<Json<GatewayDetails>>,
    cancellation_reason: Option<String>,
    refund_status: Option<String>,
    refund_amount: Option<Decimal>,
    delivered_at: Option<DateTime<Utc>>,
    checkout_key: Option<String>,
    is_deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt(format!("order {} has status {}", row.id, row.status)))?;
        let refund_status = match row.refund_status.as_deref() {
            Some(s) => Some(RefundStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("order {} has refund status {s}", row.id)))?),
            None => None,
        };
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            items: row.items.0,
            subtotal: row.subtotal,
            delivery_fee: row.delivery_fee,
            total: row.total,
            status,
            payment_method: PaymentMethod::from(row.payment_method),
            address: row.address.0,
            is_paid: row.is_paid,
            paid_at: row.paid_at,
            stock_committed: row.stock_committed,
            cart_cleared: row.cart_cleared,
            gateway: row.gateway.map(|g| g.0),
            cancellation_reason: row.cancellation_reason,
            refund_status,
            refund_amount: row.refund_amount,
            delivered_at: row.delivered_at,
            checkout_key: row.checkout_key,
            is_deleted: row.is_deleted,
            deleted_at: row.deleted_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            events: vec![],
            changed: false,
        })
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert(&self, order: &Order) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO orders (id, user_id, items, subtotal, delivery_fee, total, status, payment_method, address,
                is_paid, paid_at, stock_committed, cart_cleared, gateway, cancellation_reason, refund_status, refund_amount,
                delivered_at, checkout_key, is_deleted, deleted_at, version, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(Json(&order.items))
        .bind(order.subtotal)
        .bind(order.delivery_fee)
        .bind(order.total)
        .bind(order.status.as_str())
        .bind(order.payment_method.as_str())
        .bind(Json(&order.address))
        .bind(order.is_paid)
        .bind(order.paid_at)
        .bind(order.stock_committed)
        .bind(order.cart_cleared)
        .bind(order.gateway.as_ref().map(Json))
        .bind(&order.cancellation_reason)
        .bind(order.refund_status.map(|r| r.as_str()))
        .bind(order.refund_amount)
        .bind(order.delivered_at)
        .bind(&order.checkout_key)
        .bind(order.is_deleted)
        .bind(order.deleted_at)
        .bind(order.version)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        row.map(Order::try_from).transpose()
    }

    async fn find_by_checkout_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE user_id = $1 AND checkout_key = $2")
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    async fn update(&self, order: &mut Order) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE orders SET status = $3, is_paid = $4, paid_at = $5, stock_committed = $6, cart_cleared = $7, gateway = $8,
                cancellation_reason = $9, refund_status = $10, refund_amount = $11, delivered_at = $12,
                is_deleted = $13, deleted_at = $14, updated_at = $15, version = version + 1
             WHERE id = $1 AND version = $2",
        )
        .bind(order.id)
        .bind(order.version)
        .bind(order.status.as_str())
        .bind(order.is_paid)
        .bind(order.paid_at)
        .bind(order.stock_committed)
        .bind(order.cart_cleared)
        .bind(order.gateway.as_ref().map(Json))
        .bind(&order.cancellation_reason)
        .bind(order.refund_status.map(|r| r.as_str()))
        .bind(order.refund_amount)
        .bind(order.delivered_at)
        .bind(order.is_deleted)
        .bind(order.deleted_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM orders WHERE id = $1").bind(order.id).fetch_optional(&self.pool).await?;
            return Err(if exists.is_some() { StoreError::Conflict } else { StoreError::NotFound });
        }
        order.version += 1;
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid, query: &OrderQuery) -> StoreResult<(Vec<Order>, u64)> {
        let status = query.status.map(|s| s.as_str());
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE user_id = $1 AND NOT is_deleted AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4",
        )
        .bind(user_id)
        .bind(status)
        .bind(i64::from(query.limit))
        .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE user_id = $1 AND NOT is_deleted AND ($2::text IS NULL OR status = $2)")
            .bind(user_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        let orders = rows.into_iter().map(Order::try_from).collect::<StoreResult<Vec<_>>>()?;
        Ok((orders, total.0.max(0) as u64))
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    order_id: Uuid,
    status: String,
    actual_delivery_date: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt(format!("delivery {} has status {}", row.id, row.status)))?;
        Ok(Delivery {
            id: row.id,
            order_id: row.order_id,
            status,
            actual_delivery_date: row.actual_delivery_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn create_if_absent(&self, order_id: Uuid) -> StoreResult<(Delivery, bool)> {
        let fresh = Delivery::for_order(order_id);
        let inserted = sqlx::query_as::<_, DeliveryRow>(
            "INSERT INTO deliveries (id, order_id, status, actual_delivery_date, created_at, updated_at)
             VALUES ($1, $2, $3, NULL, $4, $5)
             ON CONFLICT (order_id) DO NOTHING
             RETURNING *",
        )
        .bind(fresh.id)
        .bind(order_id)
        .bind(fresh.status.as_str())
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok((row.try_into()?, true));
        }
        let existing = self.find_by_order(order_id).await?.ok_or(StoreError::NotFound)?;
        Ok((existing, false))
    }

    async fn find_by_order(&self, order_id: Uuid) -> StoreResult<Option<Delivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>("SELECT * FROM deliveries WHERE order_id = $1").bind(order_id).fetch_optional(&self.pool).await?;
        row.map(Delivery::try_from).transpose()
    }

    async fn save(&self, delivery: &Delivery) -> StoreResult<()> {
        sqlx::query("UPDATE deliveries SET status = $2, actual_delivery_date = $3, updated_at = $4 WHERE order_id = $1")
            .bind(delivery.order_id)
            .bind(delivery.status.as_str())
            .bind(delivery.actual_delivery_date)
            .bind(delivery.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CartStore for PgStore {
    async fn get(&self, user_id: Uuid) -> StoreResult<Option<Cart>> {
        let row: Option<(Json<Vec<CartItem>>, DateTime<Utc>)> = sqlx::query_as("SELECT items, updated_at FROM carts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(items, updated_at)| Cart::from_parts(user_id, items.0, updated_at)))
    }

    async fn save(&self, cart: &Cart) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO carts (user_id, items, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE SET items = $2, updated_at = $3",
        )
        .bind(cart.user_id())
        .bind(Json(cart.items()))
        .bind(cart.updated_at())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, user_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE carts SET items = '[]'::jsonb, updated_at = NOW() WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
