//! Persistence seams for orders, stock, deliveries and carts
//!
//! Stock is only ever changed through conditional updates: a decrement applies
//! when `stock >= quantity` and fails otherwise, so concurrent checkouts of the
//! last unit cannot both succeed. Order-scoped commits are keyed by order id so
//! that replaying a confirmation never decrements twice. Where a pharmacy keeps
//! an inventory sheet for the medicine, its quantity follows in the same step.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{Availability, Cart, Delivery, Order, OrderItem, OrderStatus, StockRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record was modified concurrently")]
    Conflict,

    #[error("record already exists")]
    Duplicate,

    #[error("insufficient stock for medicine {medicine_id} in pharmacy {pharmacy_id}")]
    InsufficientStock { medicine_id: Uuid, pharmacy_id: Uuid },

    #[error("medicine {medicine_id} is not available in pharmacy {pharmacy_id}")]
    Unavailable { medicine_id: Uuid, pharmacy_id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pagination and filter for order listings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderQuery {
    pub page: u32,
    pub limit: u32,
    pub status: Option<OrderStatus>,
}

impl Default for OrderQuery {
    fn default() -> Self { Self { page: 1, limit: 10, status: None } }
}

impl OrderQuery {
    pub fn offset(&self) -> u64 { u64::from(self.page.max(1) - 1) * u64::from(self.limit) }
}

/// Quantities per (medicine, pharmacy), so repeated lines are checked against stock together.
pub(crate) fn stock_deltas(items: &[OrderItem]) -> BTreeMap<(Uuid, Uuid), u32> {
    let mut totals = BTreeMap::new();
    for item in items {
        *totals.entry((item.medicine_id, item.pharmacy_id)).or_insert(0u32) += item.quantity.value();
    }
    totals
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_availability(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<Availability>>;

    /// Signed stock change. Negative deltas are applied only if enough stock remains.
    async fn adjust_stock(&self, medicine_id: Uuid, pharmacy_id: Uuid, delta: i64) -> StoreResult<u32>;

    /// Decrements stock for every item of an order, all or nothing.
    /// Returns `false` without touching stock when this order was already committed.
    async fn commit_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool>;

    /// Restores stock committed for an order. Returns `false` when nothing was committed.
    async fn release_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool>;

    /// The pharmacy's inventory sheet, kept in step with every stock change above.
    async fn find_stock_record(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<StockRecord>>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Fails with `Duplicate` if the id or the user's checkout key already exists.
    async fn insert(&self, order: &Order) -> StoreResult<()>;
    async fn find(&self, id: Uuid) -> StoreResult<Option<Order>>;
    async fn find_by_checkout_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<Order>>;
    /// Saves the order if nobody else saved it since it was loaded, then bumps `order.version`.
    async fn update(&self, order: &mut Order) -> StoreResult<()>;
    /// Newest first, soft-deleted orders excluded. Returns the page and the total count.
    async fn list_for_user(&self, user_id: Uuid, query: &OrderQuery) -> StoreResult<(Vec<Order>, u64)>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Inserts a pending delivery unless one exists. The flag is `true` when it was created now.
    async fn create_if_absent(&self, order_id: Uuid) -> StoreResult<(Delivery, bool)>;
    async fn find_by_order(&self, order_id: Uuid) -> StoreResult<Option<Delivery>>;
    async fn save(&self, delivery: &Delivery) -> StoreResult<()>;
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> StoreResult<Option<Cart>>;
    async fn save(&self, cart: &Cart) -> StoreResult<()>;
    /// Empties the user's cart; a missing cart is not an error.
    async fn clear(&self, user_id: Uuid) -> StoreResult<()>;
}
