//! Order Aggregate
//!
//! Owns the order lifecycle. Every mutation goes through a transition method
//! that checks the current status; the service layer persists the result with
//! an optimistic version check.
//!
//! ```text
//! pending ─────────────┬──────────────► confirmed ─► processing ─► shipped ─► delivered
//! payment_pending ─────┤                    ▲
//!        └─► payment_failed ────────────────┘
//! any state except delivered ─► cancelled
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::events::OrderEvent;
use crate::domain::value_objects::{Address, Quantity};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] Pending, PaymentPending, PaymentFailed, Confirmed, Processing, Shipped, Delivered, Cancelled }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PaymentPending => "payment_pending",
            Self::PaymentFailed => "payment_failed",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "payment_pending" => Self::PaymentPending,
            "payment_failed" => Self::PaymentFailed,
            "confirmed" => Self::Confirmed,
            "processing" => Self::Processing,
            "shipped" => Self::Shipped,
            "delivered" => Self::Delivered,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Delivered | Self::Cancelled) }

    /// Edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Delivered | Cancelled, _) => false,
            (_, Cancelled) => true,
            (Pending, Confirmed | Processing) => true,
            (PaymentPending, Confirmed | PaymentFailed) => true,
            (PaymentFailed, Confirmed) => true,
            (Confirmed, Processing) => true,
            (Processing, Shipped) => true,
            (Shipped, Delivered) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// How the order is paid. Only `Gateway` goes through the hosted payment page.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentMethod { Gateway, Immediate(String) }

impl PaymentMethod {
    pub fn is_gateway(&self) -> bool { matches!(self, Self::Gateway) }
    pub fn as_str(&self) -> &str {
        match self { Self::Gateway => "gateway", Self::Immediate(m) => m }
    }
}

impl From<String> for PaymentMethod {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "gateway" | "paymob" => Self::Gateway,
            _ => Self::Immediate(s),
        }
    }
}

impl From<PaymentMethod> for String {
    fn from(m: PaymentMethod) -> Self { m.as_str().to_string() }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus { #[default] Pending, Paid, Failed }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus { #[default] None, Pending, Approved, Rejected }

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::None => "none", Self::Pending => "pending", Self::Approved => "approved", Self::Rejected => "rejected" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s { "none" => Self::None, "pending" => Self::Pending, "approved" => Self::Approved, "rejected" => Self::Rejected, _ => return None })
    }
}

/// Gateway bookkeeping; present only on gateway orders
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDetails {
    pub transaction_id: Option<String>,
    pub external_order_id: Option<String>,
    pub payment_key: Option<String>,
    pub iframe_id: Option<String>,
    pub integration_id: Option<String>,
    pub payment_status: GatewayPaymentStatus,
    pub callback_url: Option<String>,
    pub return_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem { pub medicine_id: Uuid, pub pharmacy_id: Uuid, pub quantity: Quantity, pub unit_price: Decimal }

impl OrderItem {
    pub fn line_total(&self) -> Decimal { self.unit_price * self.quantity.as_decimal() }
}

/// Input to [`Order::place`]. Prices must already be the authoritative ones.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub items: Vec<OrderItem>,
    pub delivery_fee: Decimal,
    pub payment_method: PaymentMethod,
    pub address: Address,
    pub checkout_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub(crate) id: Uuid,
    pub(crate) user_id: Uuid,
    pub(crate) items: Vec<OrderItem>,
    pub(crate) subtotal: Decimal,
    pub(crate) delivery_fee: Decimal,
    pub(crate) total: Decimal,
    pub(crate) status: OrderStatus,
    pub(crate) payment_method: PaymentMethod,
    pub(crate) address: Address,
    pub(crate) is_paid: bool,
    pub(crate) paid_at: Option<DateTime<Utc>>,
    pub(crate) stock_committed: bool,
    #[serde(default)]
    pub(crate) cart_cleared: bool,
    pub(crate) gateway: Option<GatewayDetails>,
    pub(crate) cancellation_reason: Option<String>,
    pub(crate) refund_status: Option<RefundStatus>,
    pub(crate) refund_amount: Option<Decimal>,
    pub(crate) delivered_at: Option<DateTime<Utc>>,
    pub(crate) checkout_key: Option<String>,
    pub(crate) is_deleted: bool,
    pub(crate) deleted_at: Option<DateTime<Utc>>,
    pub(crate) version: i64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) events: Vec<OrderEvent>,
    /// Set by every transition that changes persisted state; cleared on load.
    #[serde(skip)]
    pub(crate) changed: bool,
}

/// Result of applying a successful payment to an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// First confirmation; fulfilment effects must follow.
    Confirmed,
    /// `is_paid` was already set. Nothing changed.
    AlreadyPaid,
    /// Money arrived for an order that had been cancelled; queued for refund.
    PaidAfterCancel,
}

impl Order {
    pub fn place(new: NewOrder) -> Result<Self, TransitionError> {
        if new.items.is_empty() { return Err(TransitionError::NoItems); }
        if new.delivery_fee < Decimal::ZERO { return Err(TransitionError::NegativeAmount); }
        if new.items.iter().any(|i| i.unit_price < Decimal::ZERO) { return Err(TransitionError::NegativeAmount); }

        let now = Utc::now();
        let subtotal: Decimal = new.items.iter().map(OrderItem::line_total).sum();
        let gateway = new.payment_method.is_gateway();
        let mut order = Self {
            id: Uuid::now_v7(), user_id: new.user_id, items: new.items, subtotal, delivery_fee: new.delivery_fee,
            total: subtotal + new.delivery_fee,
            status: if gateway { OrderStatus::PaymentPending } else { OrderStatus::Pending },
            payment_method: new.payment_method, address: new.address,
            is_paid: !gateway, paid_at: if gateway { None } else { Some(now) }, stock_committed: false, cart_cleared: false,
            gateway: gateway.then(GatewayDetails::default),
            cancellation_reason: None, refund_status: None, refund_amount: None, delivered_at: None,
            checkout_key: new.checkout_key, is_deleted: false, deleted_at: None, version: 0,
            created_at: now, updated_at: now, events: vec![], changed: true,
        };
        order.raise_event(OrderEvent::Placed {
            order_id: order.id, user_id: order.user_id, total: order.total, payment_method: order.payment_method.as_str().to_string(),
        });
        Ok(order)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn user_id(&self) -> Uuid { self.user_id }
    pub fn items(&self) -> &[OrderItem] { &self.items }
    pub fn subtotal(&self) -> Decimal { self.subtotal }
    pub fn delivery_fee(&self) -> Decimal { self.delivery_fee }
    pub fn total(&self) -> Decimal { self.total }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn payment_method(&self) -> &PaymentMethod { &self.payment_method }
    pub fn address(&self) -> &Address { &self.address }
    pub fn is_paid(&self) -> bool { self.is_paid }
    pub fn paid_at(&self) -> Option<DateTime<Utc>> { self.paid_at }
    pub fn stock_committed(&self) -> bool { self.stock_committed }
    pub fn gateway(&self) -> Option<&GatewayDetails> { self.gateway.as_ref() }
    pub fn cancellation_reason(&self) -> Option<&str> { self.cancellation_reason.as_deref() }
    pub fn refund_status(&self) -> Option<RefundStatus> { self.refund_status }
    pub fn refund_amount(&self) -> Option<Decimal> { self.refund_amount }
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> { self.delivered_at }
    pub fn checkout_key(&self) -> Option<&str> { self.checkout_key.as_deref() }
    pub fn is_deleted(&self) -> bool { self.is_deleted }
    pub fn version(&self) -> i64 { self.version }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn cart_cleared(&self) -> bool { self.cart_cleared }

    /// Paid but the stock/delivery/cart effects have not all been applied yet.
    pub fn needs_fulfilment(&self) -> bool {
        self.is_paid && !self.stock_committed && self.status != OrderStatus::Cancelled
    }

    /// Records the hosted payment session issued for this order.
    pub fn attach_gateway_session(&mut self, details: GatewayDetails) -> Result<(), TransitionError> {
        if self.status != OrderStatus::PaymentPending { return Err(TransitionError::Invalid { from: self.status, to: OrderStatus::PaymentPending }); }
        let external_order_id = details.external_order_id.clone().unwrap_or_default();
        self.gateway = Some(GatewayDetails { payment_status: GatewayPaymentStatus::Pending, ..details });
        self.touch();
        self.raise_event(OrderEvent::PaymentInitiated { order_id: self.id, external_order_id });
        Ok(())
    }

    /// Applies a successful payment. Idempotent: a paid order is never touched again.
    pub fn confirm_payment(&mut self, transaction_id: Option<String>) -> PaymentOutcome {
        if self.is_paid { return PaymentOutcome::AlreadyPaid; }
        let now = Utc::now();
        self.is_paid = true;
        self.paid_at = Some(now);
        let gw = self.gateway.get_or_insert_with(GatewayDetails::default);
        gw.payment_status = GatewayPaymentStatus::Paid;
        if transaction_id.is_some() { gw.transaction_id = transaction_id.clone(); }
        self.raise_event(OrderEvent::PaymentConfirmed { order_id: self.id, transaction_id, paid_at: now });

        if self.status == OrderStatus::Cancelled {
            self.refund_status = Some(RefundStatus::Pending);
            self.refund_amount = Some(self.total);
            self.touch();
            return PaymentOutcome::PaidAfterCancel;
        }
        self.set_status(OrderStatus::Confirmed);
        PaymentOutcome::Confirmed
    }

    /// Records a declined payment. Returns `false` when nothing changed.
    pub fn fail_payment(&mut self, transaction_id: Option<String>, reason: impl Into<String>) -> bool {
        if self.is_paid || !self.status.can_transition_to(OrderStatus::PaymentFailed) { return false; }
        let gw = self.gateway.get_or_insert_with(GatewayDetails::default);
        gw.payment_status = GatewayPaymentStatus::Failed;
        if transaction_id.is_some() { gw.transaction_id = transaction_id; }
        self.set_status(OrderStatus::PaymentFailed);
        self.raise_event(OrderEvent::PaymentFailed { order_id: self.id, reason: reason.into() });
        true
    }

    pub fn record_transaction(&mut self, transaction_id: String) {
        let gw = self.gateway.get_or_insert_with(GatewayDetails::default);
        if gw.transaction_id.as_deref() != Some(transaction_id.as_str()) {
            gw.transaction_id = Some(transaction_id);
            self.touch();
        }
    }

    pub fn mark_stock_committed(&mut self) {
        if self.stock_committed { return; }
        self.stock_committed = true;
        self.touch();
        self.raise_event(OrderEvent::StockCommitted { order_id: self.id });
    }

    pub fn mark_cart_cleared(&mut self) {
        if self.cart_cleared { return; }
        self.cart_cleared = true;
        self.touch();
    }

    pub fn mark_stock_released(&mut self) {
        if !self.stock_committed { return; }
        self.stock_committed = false;
        self.touch();
        self.raise_event(OrderEvent::StockReleased { order_id: self.id });
    }

    /// Cancels the order. Returns `true` when committed stock must be restored.
    ///
    /// Calling this again on a cancelled order whose stock is still committed
    /// resumes the restoration instead of failing.
    pub fn cancel(&mut self, reason: Option<String>) -> Result<bool, TransitionError> {
        if self.status == OrderStatus::Cancelled && self.stock_committed { return Ok(true); }
        if self.status.is_terminal() { return Err(TransitionError::NotCancellable(self.status)); }
        self.cancellation_reason = reason.clone();
        if self.is_paid {
            self.refund_status = Some(RefundStatus::Pending);
            self.refund_amount = Some(self.total);
        } else {
            self.refund_status = Some(RefundStatus::None);
        }
        self.set_status(OrderStatus::Cancelled);
        self.raise_event(OrderEvent::Cancelled { order_id: self.id, reason });
        Ok(self.stock_committed)
    }

    /// Manual progression by staff. Payment-driven states cannot be reached this way.
    pub fn advance_to(&mut self, next: OrderStatus) -> Result<(), TransitionError> {
        let manual = match next {
            OrderStatus::Confirmed => self.status == OrderStatus::Pending,
            OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Delivered => true,
            _ => false,
        };
        if !manual || !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid { from: self.status, to: next });
        }
        if !self.stock_committed { return Err(TransitionError::NotFulfilled); }
        if next == OrderStatus::Delivered { self.delivered_at = Some(Utc::now()); }
        self.set_status(next);
        Ok(())
    }

    pub fn soft_delete(&mut self) {
        if self.is_deleted { return; }
        let now = Utc::now();
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.touch();
    }

    pub(crate) fn has_changes(&self) -> bool { self.changed }
    pub(crate) fn clear_changes(&mut self) { self.changed = false; }

    pub fn take_events(&mut self) -> Vec<OrderEvent> { std::mem::take(&mut self.events) }

    fn set_status(&mut self, next: OrderStatus) {
        if self.status == next { return; }
        let from = self.status;
        self.status = next;
        self.touch();
        self.raise_event(OrderEvent::StatusChanged { order_id: self.id, from, to: next });
    }
    fn raise_event(&mut self, e: OrderEvent) { self.events.push(e); }
    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.changed = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError { NoItems, NegativeAmount, NotCancellable(OrderStatus), NotFulfilled, Invalid { from: OrderStatus, to: OrderStatus } }
impl std::error::Error for TransitionError {}
impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoItems => write!(f, "order has no items"),
            Self::NegativeAmount => write!(f, "amounts must not be negative"),
            Self::NotCancellable(s) => write!(f, "order in status {s} cannot be cancelled"),
            Self::NotFulfilled => write!(f, "order stock has not been committed"),
            Self::Invalid { from, to } => write!(f, "cannot move order from {from} to {to}"),
        }
    }
}
