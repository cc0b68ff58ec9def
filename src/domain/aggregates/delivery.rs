//! Delivery record, one per fulfilled order

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus { #[default] Pending, Assigned, PickedUp, InTransit, Delivered, Failed }

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::PickedUp => "picked_up",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "assigned" => Self::Assigned,
            "picked_up" => Self::PickedUp,
            "in_transit" => Self::InTransit,
            "delivered" => Self::Delivered,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: DeliveryStatus,
    pub actual_delivery_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn for_order(order_id: Uuid) -> Self {
        let now = Utc::now();
        Self { id: Uuid::now_v7(), order_id, status: DeliveryStatus::Pending, actual_delivery_date: None, created_at: now, updated_at: now }
    }

    pub fn set_status(&mut self, status: DeliveryStatus) {
        if status == DeliveryStatus::Delivered && self.actual_delivery_date.is_none() {
            self.actual_delivery_date = Some(Utc::now());
        }
        self.status = status;
        self.updated_at = Utc::now();
    }
}
