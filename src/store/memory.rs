//! In-memory store for development and tests
//!
//! One mutex guards every collection, so an order-scoped stock commit is
//! checked and applied as a single step.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{stock_deltas, CartStore, CatalogStore, DeliveryStore, OrderQuery, OrderRepository, StoreError, StoreResult};
use crate::domain::aggregates::{Availability, Cart, Delivery, Order, OrderItem, PharmacyMedicine, StockError, StockRecord};

impl State {
    fn sync_stock_record(&mut self, medicine_id: Uuid, pharmacy_id: Uuid, restocked: bool) {
        let Some(stock) = self.stock.get(&(medicine_id, pharmacy_id)).map(PharmacyMedicine::stock) else { return };
        if let Some(record) = self.stock_records.get_mut(&(medicine_id, pharmacy_id)) {
            if record.sync(stock, restocked) {
                tracing::warn!(%medicine_id, %pharmacy_id, quantity = stock, reorder_level = record.reorder_level, "Stock at reorder level");
            }
        }
    }
}

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    stock: HashMap<(Uuid, Uuid), PharmacyMedicine>,
    stock_records: HashMap<(Uuid, Uuid), StockRecord>,
    committed: HashSet<Uuid>,
    deliveries: HashMap<Uuid, Delivery>,
    carts: HashMap<Uuid, Cart>,
}

/// Thread-safe in-memory implementation of every store trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn upsert_pharmacy_medicine(&self, record: PharmacyMedicine) {
        self.state.lock().await.stock.insert((record.medicine_id, record.pharmacy_id), record);
    }

    pub async fn pharmacy_medicine(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> Option<PharmacyMedicine> {
        self.state.lock().await.stock.get(&(medicine_id, pharmacy_id)).cloned()
    }

    pub async fn upsert_stock_record(&self, record: StockRecord) {
        self.state.lock().await.stock_records.insert((record.medicine_id, record.pharmacy_id), record);
    }

    pub async fn stock_of(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> Option<u32> {
        self.pharmacy_medicine(medicine_id, pharmacy_id).await.map(|pm| pm.stock())
    }

    pub async fn delivery_count(&self) -> usize { self.state.lock().await.deliveries.len() }
}

fn shortfall(medicine_id: Uuid, pharmacy_id: Uuid) -> StoreError { StoreError::InsufficientStock { medicine_id, pharmacy_id } }
fn unavailable(medicine_id: Uuid, pharmacy_id: Uuid) -> StoreError { StoreError::Unavailable { medicine_id, pharmacy_id } }

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_availability(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<Availability>> {
        Ok(self.state.lock().await.stock.get(&(medicine_id, pharmacy_id)).map(PharmacyMedicine::availability))
    }

    async fn adjust_stock(&self, medicine_id: Uuid, pharmacy_id: Uuid, delta: i64) -> StoreResult<u32> {
        let mut state = self.state.lock().await;
        let record = state.stock.get_mut(&(medicine_id, pharmacy_id)).ok_or_else(|| unavailable(medicine_id, pharmacy_id))?;
        if delta < 0 && !record.is_sellable() { return Err(unavailable(medicine_id, pharmacy_id)); }
        let stock = record.adjust(delta).map_err(|e| match e {
            StockError::Insufficient { .. } => shortfall(medicine_id, pharmacy_id),
            StockError::Overflow => StoreError::Corrupt(format!("stock overflow for {medicine_id}@{pharmacy_id}")),
        })?;
        state.sync_stock_record(medicine_id, pharmacy_id, delta > 0);
        Ok(stock)
    }

    async fn commit_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.committed.contains(&order_id) { return Ok(false); }
        let deltas = stock_deltas(items);
        for (&(medicine_id, pharmacy_id), &quantity) in &deltas {
            let record = state.stock.get(&(medicine_id, pharmacy_id)).ok_or_else(|| unavailable(medicine_id, pharmacy_id))?;
            if !record.is_sellable() { return Err(unavailable(medicine_id, pharmacy_id)); }
            if record.stock() < quantity { return Err(shortfall(medicine_id, pharmacy_id)); }
        }
        for ((medicine_id, pharmacy_id), quantity) in deltas {
            if let Some(record) = state.stock.get_mut(&(medicine_id, pharmacy_id)) {
                record.adjust(-i64::from(quantity)).map_err(|_| shortfall(medicine_id, pharmacy_id))?;
            }
            state.sync_stock_record(medicine_id, pharmacy_id, false);
        }
        state.committed.insert(order_id);
        Ok(true)
    }

    async fn release_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.committed.remove(&order_id) { return Ok(false); }
        for ((medicine_id, pharmacy_id), quantity) in stock_deltas(items) {
            match state.stock.get_mut(&(medicine_id, pharmacy_id)) {
                Some(record) => { record.adjust(i64::from(quantity)).map_err(|e| StoreError::Corrupt(e.to_string()))?; }
                None => tracing::warn!(%order_id, %medicine_id, %pharmacy_id, "Stock record vanished, cannot restore"),
            }
            state.sync_stock_record(medicine_id, pharmacy_id, false);
        }
        Ok(true)
    }

    async fn find_stock_record(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<StockRecord>> {
        Ok(self.state.lock().await.stock_records.get(&(medicine_id, pharmacy_id)).cloned())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert(&self, order: &Order) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.id()) { return Err(StoreError::Duplicate); }
        if let Some(key) = order.checkout_key() {
            if state.orders.values().any(|o| o.user_id() == order.user_id() && o.checkout_key() == Some(key)) {
                return Err(StoreError::Duplicate);
            }
        }
        let mut stored = order.clone();
        stored.events.clear();
        state.orders.insert(order.id(), stored);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_checkout_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.values().find(|o| o.user_id() == user_id && o.checkout_key() == Some(key)).cloned())
    }

    async fn update(&self, order: &mut Order) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let current = state.orders.get(&order.id()).ok_or(StoreError::NotFound)?;
        if current.version() != order.version() { return Err(StoreError::Conflict); }
        order.version += 1;
        let mut stored = order.clone();
        stored.events.clear();
        state.orders.insert(order.id(), stored);
        Ok(())
    }

    async fn list_for_user(&self, user_id: Uuid, query: &OrderQuery) -> StoreResult<(Vec<Order>, u64)> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| o.user_id() == user_id && !o.is_deleted())
            .filter(|o| query.status.map_or(true, |s| o.status() == s))
            .collect();
        matching.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then_with(|| b.id().cmp(&a.id())));
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_if_absent(&self, order_id: Uuid) -> StoreResult<(Delivery, bool)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.deliveries.get(&order_id) { return Ok((existing.clone(), false)); }
        let delivery = Delivery::for_order(order_id);
        state.deliveries.insert(order_id, delivery.clone());
        Ok((delivery, true))
    }

    async fn find_by_order(&self, order_id: Uuid) -> StoreResult<Option<Delivery>> {
        Ok(self.state.lock().await.deliveries.get(&order_id).cloned())
    }

    async fn save(&self, delivery: &Delivery) -> StoreResult<()> {
        self.state.lock().await.deliveries.insert(delivery.order_id, delivery.clone());
        Ok(())
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn get(&self, user_id: Uuid) -> StoreResult<Option<Cart>> {
        Ok(self.state.lock().await.carts.get(&user_id).cloned())
    }

    async fn save(&self, cart: &Cart) -> StoreResult<()> {
        self.state.lock().await.carts.insert(cart.user_id(), cart.clone());
        Ok(())
    }

    async fn clear(&self, user_id: Uuid) -> StoreResult<()> {
        if let Some(cart) = self.state.lock().await.carts.get_mut(&user_id) { cart.clear(); }
        Ok(())
    }
}
