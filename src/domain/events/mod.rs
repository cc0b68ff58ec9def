//! Domain events
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::OrderStatus;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, user_id: Uuid, total: Decimal, payment_method: String },
    PaymentInitiated { order_id: Uuid, external_order_id: String },
    PaymentFailed { order_id: Uuid, reason: String },
    PaymentConfirmed { order_id: Uuid, transaction_id: Option<String>, paid_at: DateTime<Utc> },
    StockCommitted { order_id: Uuid },
    StockReleased { order_id: Uuid },
    StatusChanged { order_id: Uuid, from: OrderStatus, to: OrderStatus },
    Cancelled { order_id: Uuid, reason: Option<String> },
}

impl OrderEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            Self::Placed { order_id, .. }
            | Self::PaymentInitiated { order_id, .. }
            | Self::PaymentFailed { order_id, .. }
            | Self::PaymentConfirmed { order_id, .. }
            | Self::StockCommitted { order_id }
            | Self::StockReleased { order_id }
            | Self::StatusChanged { order_id, .. }
            | Self::Cancelled { order_id, .. } => *order_id,
        }
    }

    /// NATS subject this event is published on.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "orders.placed",
            Self::PaymentInitiated { .. } => "orders.payment_initiated",
            Self::PaymentFailed { .. } => "orders.payment_failed",
            Self::PaymentConfirmed { .. } => "orders.payment_confirmed",
            Self::StockCommitted { .. } => "orders.stock_committed",
            Self::StockReleased { .. } => "orders.stock_released",
            Self::StatusChanged { .. } => "orders.status_changed",
            Self::Cancelled { .. } => "orders.cancelled",
        }
    }
}

/// Publishes order events to NATS when a client is configured; otherwise a no-op.
#[derive(Clone, Default)]
pub struct EventPublisher {
    nats: Option<async_nats::Client>,
}

impl EventPublisher {
    pub fn new(nats: Option<async_nats::Client>) -> Self { Self { nats } }
    pub fn disabled() -> Self { Self { nats: None } }

    pub async fn publish_all(&self, events: Vec<OrderEvent>) {
        let Some(nats) = &self.nats else { return };
        for event in events {
            let payload = match serde_json::to_vec(&event) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, subject = event.subject(), "Failed to encode order event");
                    continue;
                }
            };
            if let Err(e) = nats.publish(event.subject().to_string(), payload.into()).await {
                tracing::warn!(error = %e, order_id = %event.order_id(), "Failed to publish order event");
            }
        }
    }
}
