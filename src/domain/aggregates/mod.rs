//! Aggregates module
pub mod cart;
pub mod delivery;
pub mod order;
pub mod pharmacy_medicine;

pub use cart::{Cart, CartItem};
pub use delivery::{Delivery, DeliveryStatus};
pub use order::{GatewayDetails, GatewayPaymentStatus, NewOrder, Order, OrderItem, OrderStatus, PaymentMethod, PaymentOutcome, RefundStatus, TransitionError};
pub use pharmacy_medicine::{Availability, PharmacyMedicine, StockError, StockRecord};
