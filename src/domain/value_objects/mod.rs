//! Value Objects for orders and payments

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum difference tolerated between a declared and a computed amount.
pub fn amount_tolerance() -> Decimal { Decimal::new(1, 2) }

/// True when `a` and `b` differ by at most 0.01.
pub fn amounts_match(a: Decimal, b: Decimal) -> bool { (a - b).abs() <= amount_tolerance() }

/// Converts a major-unit amount (e.g. 22.50) to minor units (2250), rounding half away from zero.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    (amount * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Quantity value object, always at least one unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Result<Self, QuantityError> {
        if value == 0 { return Err(QuantityError::Zero); }
        Ok(Self(value))
    }
    pub fn value(&self) -> u32 { self.0 }
    pub fn as_decimal(&self) -> Decimal { Decimal::from(self.0) }
}

impl TryFrom<u32> for Quantity {
    type Error = QuantityError;
    fn try_from(value: u32) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<Quantity> for u32 {
    fn from(q: Quantity) -> Self { q.0 }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum QuantityError { Zero }
impl std::error::Error for QuantityError {}
impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "quantity must be at least 1") }
}

/// App deep link the mobile client registers to resume after a hosted payment.
///
/// Always renders as `<scheme>://payment-complete/<order_id>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeepLink(String);

impl DeepLink {
    pub fn payment_complete(scheme: &str, order_id: &str) -> Self {
        let scheme = scheme.trim().trim_end_matches("://");
        let scheme = if scheme.is_empty() { "app" } else { scheme };
        Self(format!("{scheme}://payment-complete/{order_id}"))
    }
    pub fn for_order(scheme: &str, order_id: Uuid) -> Self { Self::payment_complete(scheme, &order_id.to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_string(self) -> String { self.0 }
}

impl fmt::Display for DeepLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Shipping address captured at checkout
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub apartment: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_rejects_zero() {
        assert_eq!(Quantity::new(0), Err(QuantityError::Zero));
        assert_eq!(Quantity::new(3).unwrap().value(), 3);
        assert!(serde_json::from_str::<Quantity>("0").is_err());
    }

    #[test]
    fn test_amount_tolerance() {
        assert!(amounts_match(Decimal::new(2000, 2), Decimal::new(2001, 2)));
        assert!(!amounts_match(Decimal::new(2000, 2), Decimal::new(2002, 2)));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(Decimal::new(2200, 2)), Some(2200));
        assert_eq!(to_minor_units(Decimal::new(10005, 3)), Some(1001));
    }

    #[test]
    fn test_deep_link() {
        assert_eq!(DeepLink::payment_complete("sehaty", "abc").as_str(), "sehaty://payment-complete/abc");
        assert_eq!(DeepLink::payment_complete("sehaty://", "abc").as_str(), "sehaty://payment-complete/abc");
        assert_eq!(DeepLink::payment_complete(" ", "abc").as_str(), "app://payment-complete/abc");
    }
}
