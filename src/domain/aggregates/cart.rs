//! Cart Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One user's cart. Items are keyed by (medicine, pharmacy).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    user_id: Uuid,
    items: Vec<CartItem>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub medicine_id: Uuid,
    pub pharmacy_id: Uuid,
    pub quantity: u32,
    /// Price snapshot taken when the item was added; checkout re-prices.
    pub price: Decimal,
}

impl Cart {
    pub fn new(user_id: Uuid) -> Self { Self { user_id, items: vec![], updated_at: Utc::now() } }

    pub(crate) fn from_parts(user_id: Uuid, items: Vec<CartItem>, updated_at: DateTime<Utc>) -> Self { Self { user_id, items, updated_at } }

    pub fn user_id(&self) -> Uuid { self.user_id }
    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn item_count(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn add_item(&mut self, item: CartItem) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.medicine_id == item.medicine_id && i.pharmacy_id == item.pharmacy_id) {
            existing.quantity += item.quantity;
            existing.price = item.price;
        } else {
            self.items.push(item);
        }
        self.touch();
    }

    pub fn clear(&mut self) { self.items.clear(); self.touch(); }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
