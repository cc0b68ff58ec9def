//! Reads, cancellation and staff-driven status progression

use serde::Serialize;
use uuid::Uuid;

use super::{OrderService, Principal};
use crate::domain::aggregates::{Delivery, DeliveryStatus, Order, OrderStatus};
use crate::error::{OrderError, Result};
use crate::store::OrderQuery;

const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, Serialize)]
pub struct OrderDetail {
    pub order: Order,
    pub delivery: Option<Delivery>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub current_page: u32,
    pub total_pages: u64,
    pub total_orders: u64,
}

impl OrderService {
    pub async fn get_order(&self, principal: &Principal, order_id: Uuid) -> Result<OrderDetail> {
        let order = self.load_for(principal, order_id, true).await?;
        let delivery = self.deliveries.find_by_order(order_id).await?;
        Ok(OrderDetail { order, delivery })
    }

    /// The caller's own orders, newest first.
    pub async fn list_orders(&self, principal: &Principal, query: OrderQuery) -> Result<OrderPage> {
        let query = OrderQuery { page: query.page.max(1), limit: query.limit.clamp(1, MAX_PAGE_SIZE), ..query };
        let (orders, total) = self.orders.list_for_user(principal.user_id, &query).await?;
        Ok(OrderPage {
            orders,
            current_page: query.page,
            total_pages: total.div_ceil(u64::from(query.limit)),
            total_orders: total,
        })
    }

    /// Cancels an order on behalf of its owner or an admin.
    ///
    /// With `archive` the order is also soft-deleted, which is allowed for
    /// orders that are already cancelled.
    pub async fn cancel(&self, principal: &Principal, order_id: Uuid, reason: Option<String>, archive: bool) -> Result<Order> {
        self.load_for(principal, order_id, true).await?;
        let order = self.cancel_order(order_id, reason, archive).await?;
        tracing::info!(%order_id, cancelled_by = %principal.user_id, archived = archive, "Order cancelled");
        Ok(order)
    }

    /// The stock release is keyed on the order's ledger entry, so it runs for
    /// every paid order. A confirmation that took stock but failed to record it
    /// on the order is undone here as well.
    async fn cancel_order(&self, order_id: Uuid, reason: Option<String>, archive: bool) -> Result<Order> {
        let (order, ()) = self
            .mutate(order_id, |o| {
                if !(archive && o.status() == OrderStatus::Cancelled) {
                    o.cancel(reason.clone())?;
                }
                if archive { o.soft_delete(); }
                Ok(())
            })
            .await?;
        if !order.is_paid() && !order.stock_committed() { return Ok(order); }

        if self.catalog.release_order_stock(order_id, order.items()).await? {
            tracing::info!(%order_id, "Stock restored");
        }
        let (order, ()) = self.mutate(order_id, |o| {
            o.mark_stock_released();
            Ok(())
        })
        .await?;
        Ok(order)
    }

    /// Staff progression through fulfilment. The delivery record follows:
    /// `delivered` closes it, any other step marks it in transit.
    pub async fn update_status(&self, principal: &Principal, order_id: Uuid, next: OrderStatus) -> Result<Order> {
        if !principal.can_manage_fulfilment() { return Err(OrderError::NotAuthorized); }
        let current = self.load(order_id).await?;
        if current.is_deleted() { return Err(OrderError::OrderNotFound); }
        if next == OrderStatus::Cancelled {
            let order = self.cancel_order(order_id, Some("cancelled by staff".into()), false).await?;
            tracing::info!(%order_id, cancelled_by = %principal.user_id, "Order cancelled by staff");
            return Ok(order);
        }

        let from = current.status();
        let (order, ()) = self.mutate(order_id, |o| Ok(o.advance_to(next)?)).await?;
        tracing::info!(%order_id, %from, to = %next, updated_by = %principal.user_id, "Order status updated");

        if let Some(mut delivery) = self.deliveries.find_by_order(order_id).await? {
            delivery.set_status(if next == OrderStatus::Delivered { DeliveryStatus::Delivered } else { DeliveryStatus::InTransit });
            self.deliveries.save(&delivery).await?;
        }
        Ok(order)
    }
}
