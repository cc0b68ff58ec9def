//! Pharmacy-scoped stock record

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Price and stock of one medicine at one pharmacy. `stock` never goes below zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PharmacyMedicine {
    pub pharmacy_id: Uuid,
    pub medicine_id: Uuid,
    stock: u32,
    pub price: Decimal,
    pub is_available: bool,
    pub is_deleted: bool,
    pub updated_at: DateTime<Utc>,
}

/// What checkout needs to know about a stock record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability { pub price: Decimal, pub stock: u32, pub is_available: bool }

impl PharmacyMedicine {
    pub fn new(pharmacy_id: Uuid, medicine_id: Uuid, stock: u32, price: Decimal) -> Self {
        Self { pharmacy_id, medicine_id, stock, price, is_available: true, is_deleted: false, updated_at: Utc::now() }
    }

    pub fn stock(&self) -> u32 { self.stock }
    pub fn is_sellable(&self) -> bool { self.is_available && !self.is_deleted }

    pub fn availability(&self) -> Availability {
        Availability { price: self.price, stock: self.stock, is_available: self.is_sellable() }
    }

    /// Applies a signed stock delta. A decrement larger than the stock fails and leaves it unchanged.
    pub fn adjust(&mut self, delta: i64) -> Result<u32, StockError> {
        let next = i64::from(self.stock) + delta;
        if next < 0 { return Err(StockError::Insufficient { available: self.stock, requested: delta.unsigned_abs() }); }
        self.stock = u32::try_from(next).map_err(|_| StockError::Overflow)?;
        self.updated_at = Utc::now();
        Ok(self.stock)
    }
}

/// Pharmacy inventory sheet for one medicine. `quantity` mirrors the sellable
/// stock after every change made through the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub pharmacy_id: Uuid,
    pub medicine_id: Uuid,
    pub quantity: u32,
    pub reorder_level: u32,
    pub last_restocked: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    pub const DEFAULT_REORDER_LEVEL: u32 = 10;

    pub fn new(pharmacy_id: Uuid, medicine_id: Uuid, quantity: u32) -> Self {
        Self { pharmacy_id, medicine_id, quantity, reorder_level: Self::DEFAULT_REORDER_LEVEL, last_restocked: None, updated_at: Utc::now() }
    }

    pub fn needs_reorder(&self) -> bool { self.quantity <= self.reorder_level }

    /// Copies the current stock. Returns `true` when this drops the record to its reorder level.
    pub fn sync(&mut self, stock: u32, restocked: bool) -> bool {
        let was_above = !self.needs_reorder();
        let now = Utc::now();
        self.quantity = stock;
        self.updated_at = now;
        if restocked { self.last_restocked = Some(now); }
        was_above && self.needs_reorder()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum StockError { Insufficient { available: u32, requested: u64 }, Overflow }
impl std::error::Error for StockError {}
impl std::fmt::Display for StockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insufficient { available, requested } => write!(f, "Insufficient stock: {requested} requested, {available} available"),
            Self::Overflow => write!(f, "Stock overflow"),
        }
    }
}
