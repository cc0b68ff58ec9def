//! Order workflow: checkout, payment reconciliation and lifecycle
//!
//! Every order mutation is a load → transition → versioned save cycle; on a
//! version conflict the cycle is retried against the fresh copy. No lock is
//! held across a gateway call.

mod checkout;
mod lifecycle;
mod payments;

pub use checkout::{CheckoutItem, CheckoutReceipt, CheckoutRequest};
pub use lifecycle::{OrderDetail, OrderPage};
pub use payments::{CallbackOutcome, PaymentStatusView};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::aggregates::Order;
use crate::domain::events::EventPublisher;
use crate::domain::value_objects::DeepLink;
use crate::error::{OrderError, Result};
use crate::payment::{PaymentGateway, SignatureVerifier};
use crate::store::{CartStore, CatalogStore, DeliveryStore, OrderRepository, StoreError};

const SAVE_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role { User, Admin, PharmacyOwner }

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "pharmacy_owner" => Some(Self::PharmacyOwner),
            _ => None,
        }
    }
}

/// Authenticated caller, as asserted by the upstream auth layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn user(user_id: Uuid) -> Self { Self { user_id, role: Role::User } }
    pub fn admin(user_id: Uuid) -> Self { Self { user_id, role: Role::Admin } }

    pub fn is_admin(&self) -> bool { self.role == Role::Admin }
    pub fn can_manage_fulfilment(&self) -> bool { matches!(self.role, Role::Admin | Role::PharmacyOwner) }

    fn owns(&self, order: &Order) -> bool { order.user_id() == self.user_id }
}

/// Where the gateway calls back and where customers are sent afterwards.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    pub deep_link_scheme: String,
    pub callback_url: String,
}

#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    catalog: Arc<dyn CatalogStore>,
    deliveries: Arc<dyn DeliveryStore>,
    carts: Arc<dyn CartStore>,
    gateway: Arc<dyn PaymentGateway>,
    signatures: SignatureVerifier,
    events: EventPublisher,
    settings: ServiceSettings,
}

impl OrderService {
    /// Builds the service over one store backing all four persistence seams.
    pub fn new<S>(store: S, gateway: Arc<dyn PaymentGateway>, signatures: SignatureVerifier, settings: ServiceSettings) -> Self
    where
        S: OrderRepository + CatalogStore + DeliveryStore + CartStore + Clone + 'static,
    {
        Self {
            orders: Arc::new(store.clone()),
            catalog: Arc::new(store.clone()),
            deliveries: Arc::new(store.clone()),
            carts: Arc::new(store),
            gateway,
            signatures,
            events: EventPublisher::disabled(),
            settings,
        }
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn deep_link(&self, order_id: Uuid) -> DeepLink { DeepLink::for_order(&self.settings.deep_link_scheme, order_id) }

    async fn load(&self, order_id: Uuid) -> Result<Order> {
        self.orders.find(order_id).await?.ok_or(OrderError::OrderNotFound)
    }

    /// Loads a live order the caller may see: the owner, or an admin when `admin_allowed`.
    async fn load_for(&self, principal: &Principal, order_id: Uuid, admin_allowed: bool) -> Result<Order> {
        let order = self.load(order_id).await?;
        if order.is_deleted() { return Err(OrderError::OrderNotFound); }
        if !principal.owns(&order) && !(admin_allowed && principal.is_admin()) {
            return Err(OrderError::NotAuthorized);
        }
        Ok(order)
    }

    /// Applies `change` to the stored order and saves it with a version check,
    /// reloading and reapplying on conflict. Unchanged orders are not written.
    async fn mutate<T, F>(&self, order_id: Uuid, change: F) -> Result<(Order, T)>
    where
        F: Fn(&mut Order) -> Result<T> + Send,
        T: Send,
    {
        for attempt in 1..=SAVE_ATTEMPTS {
            let mut order = self.load(order_id).await?;
            order.clear_changes();
            let out = change(&mut order)?;
            if !order.has_changes() {
                return Ok((order, out));
            }
            let events = order.take_events();
            match self.orders.update(&mut order).await {
                Ok(()) => {
                    self.events.publish_all(events).await;
                    return Ok((order, out));
                }
                Err(StoreError::Conflict) => {
                    tracing::debug!(%order_id, attempt, "Order changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrderError::Conflict)
    }
}
