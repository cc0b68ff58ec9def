//! Checkout: cart lines in, order (and possibly a hosted payment page) out

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{OrderService, Principal};
use crate::domain::aggregates::{GatewayDetails, NewOrder, Order, OrderItem, PaymentMethod};
use crate::domain::value_objects::{amounts_match, to_minor_units, Address, Quantity};
use crate::error::{OrderError, Result};
use crate::payment::{BillingData, CustomerProfile};
use crate::store::StoreError;

fn non_negative(value: &Decimal) -> std::result::Result<(), ValidationError> {
    if *value < Decimal::ZERO { return Err(ValidationError::new("negative_amount")); }
    Ok(())
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckoutItem {
    pub medicine_id: Uuid,
    pub pharmacy_id: Uuid,
    pub quantity: Quantity,
}

/// Checkout payload. Amounts are the client's declared figures and are
/// checked against catalog prices before anything is written.
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, message = "order must contain at least one item"))]
    pub items: Vec<CheckoutItem>,
    #[serde(default)]
    pub address: Address,
    pub payment_method: PaymentMethod,
    #[validate(custom = "non_negative")]
    pub subtotal: Decimal,
    #[validate(custom = "non_negative")]
    pub delivery_fee: Decimal,
    #[validate(custom = "non_negative")]
    pub total: Decimal,
    #[serde(default)]
    pub customer: CustomerProfile,
}

#[derive(Clone, Debug, Serialize)]
pub struct CheckoutReceipt {
    #[serde(flatten)]
    pub order: Order,
    pub requires_payment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    pub deep_link: String,
    /// Set when an earlier checkout with the same idempotency key was returned.
    #[serde(skip)]
    pub replayed: bool,
}

impl OrderService {
    /// Places an order for the caller.
    ///
    /// Gateway orders come back `payment_pending` with a hosted payment URL and
    /// leave stock and cart alone. Every other method is settled on the spot:
    /// stock is committed, a delivery is opened and the cart emptied.
    pub async fn checkout(&self, principal: &Principal, request: CheckoutRequest, idempotency_key: Option<String>) -> Result<CheckoutReceipt> {
        request.validate()?;
        let key = idempotency_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
        if let Some(key) = &key {
            if let Some(existing) = self.orders.find_by_checkout_key(principal.user_id, key).await? {
                tracing::info!(order_id = %existing.id(), "Checkout replayed with idempotency key");
                return Ok(self.receipt(existing, true));
            }
        }

        let items = self.price_items(&request.items).await?;
        let subtotal: Decimal = items.iter().map(OrderItem::line_total).sum();
        if !amounts_match(request.subtotal, subtotal) {
            return Err(OrderError::TotalMismatch { field: "subtotal", declared: request.subtotal, calculated: subtotal });
        }
        let total = subtotal + request.delivery_fee;
        if !amounts_match(request.total, total) {
            return Err(OrderError::TotalMismatch { field: "total", declared: request.total, calculated: total });
        }

        let mut order = Order::place(NewOrder {
            user_id: principal.user_id,
            items,
            delivery_fee: request.delivery_fee,
            payment_method: request.payment_method,
            address: request.address,
            checkout_key: key.clone(),
        })?;
        let events = order.take_events();
        match self.orders.insert(&order).await {
            Ok(()) => self.events.publish_all(events).await,
            Err(StoreError::Duplicate) => {
                // a concurrent checkout with the same key got there first
                let Some(key) = &key else { return Err(OrderError::Conflict) };
                let existing = self.orders.find_by_checkout_key(principal.user_id, key).await?.ok_or(OrderError::Conflict)?;
                return Ok(self.receipt(existing, true));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            order_id = %order.id(),
            user_id = %principal.user_id,
            total = %order.total(),
            payment_method = order.payment_method().as_str(),
            "Order placed"
        );

        if order.payment_method().is_gateway() {
            self.start_gateway_payment(order, &request.customer).await
        } else {
            self.settle_immediate(order).await
        }
    }

    /// Resolves each line against the pharmacy's stock record and takes its current price.
    async fn price_items(&self, lines: &[CheckoutItem]) -> Result<Vec<OrderItem>> {
        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let (medicine_id, pharmacy_id) = (line.medicine_id, line.pharmacy_id);
            let availability = self
                .catalog
                .find_availability(medicine_id, pharmacy_id)
                .await?
                .filter(|a| a.is_available)
                .ok_or(OrderError::ItemUnavailable { medicine_id, pharmacy_id })?;
            if availability.stock < line.quantity.value() {
                return Err(OrderError::InsufficientStock { medicine_id, pharmacy_id });
            }
            items.push(OrderItem { medicine_id, pharmacy_id, quantity: line.quantity, unit_price: availability.price });
        }
        Ok(items)
    }

    async fn start_gateway_payment(&self, order: Order, customer: &CustomerProfile) -> Result<CheckoutReceipt> {
        let order_id = order.id();
        let amount_cents = to_minor_units(order.total()).ok_or_else(|| OrderError::Validation("order total is out of range".into()))?;
        let billing = BillingData::from_customer(customer, order.address());
        let return_url = self.deep_link(order_id).into_string();

        let session = match self.gateway.create_payment_session(order_id, amount_cents, &billing, &return_url).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(%order_id, error = %e, "Payment initiation failed");
                let reason = e.to_string();
                if let Err(save_err) = self.mutate(order_id, |o| Ok(o.fail_payment(None, reason.clone()))).await {
                    tracing::error!(%order_id, error = %save_err, "Could not mark order as payment_failed");
                }
                return Err(e.into());
            }
        };

        let details = GatewayDetails {
            external_order_id: Some(session.external_order_id.clone()),
            payment_key: Some(session.payment_key.clone()),
            iframe_id: Some(self.gateway.iframe_id().to_string()),
            integration_id: Some(self.gateway.integration_id().to_string()),
            callback_url: Some(self.settings.callback_url.clone()),
            return_url: Some(return_url.clone()),
            ..GatewayDetails::default()
        };
        let (order, ()) = self.mutate(order_id, |o| Ok(o.attach_gateway_session(details.clone())?)).await?;
        tracing::info!(%order_id, external_order_id = %session.external_order_id, "Payment session created");
        Ok(CheckoutReceipt { order, requires_payment: true, payment_url: Some(session.payment_url), deep_link: return_url, replayed: false })
    }

    async fn settle_immediate(&self, order: Order) -> Result<CheckoutReceipt> {
        let order_id = order.id();
        match self.fulfil(order).await {
            Ok(order) => Ok(self.receipt(order, false)),
            Err(e @ (OrderError::InsufficientStock { .. } | OrderError::ItemUnavailable { .. })) => {
                // stock moved between pricing and commit; nothing was decremented
                tracing::warn!(%order_id, error = %e, "Stock no longer available, cancelling order");
                self.mutate(order_id, |o| Ok(o.cancel(Some("stock no longer available".into()))?)).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn receipt(&self, order: Order, replayed: bool) -> CheckoutReceipt {
        let requires_payment = order.payment_method().is_gateway() && !order.is_paid() && !order.status().is_terminal();
        let payment_url = order
            .gateway()
            .and_then(|g| g.payment_key.as_deref())
            .filter(|_| requires_payment)
            .map(|key| self.gateway.payment_url(key));
        let deep_link = self.deep_link(order.id()).into_string();
        CheckoutReceipt { order, requires_payment, payment_url, deep_link, replayed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(items: serde_json::Value) -> CheckoutRequest {
        serde_json::from_value(json!({
            "items": items,
            "payment_method": "cash",
            "subtotal": "20.00",
            "delivery_fee": "2.00",
            "total": "22.00",
        }))
        .unwrap()
    }

    #[test]
    fn test_request_rejects_empty_items() {
        assert!(request(json!([])).validate().is_err());
        let line = json!([{ "medicine_id": Uuid::now_v7(), "pharmacy_id": Uuid::now_v7(), "quantity": 2 }]);
        assert!(request(line).validate().is_ok());
    }

    #[test]
    fn test_request_rejects_zero_quantity_and_negative_fee() {
        let zero = json!({
            "items": [{ "medicine_id": Uuid::now_v7(), "pharmacy_id": Uuid::now_v7(), "quantity": 0 }],
            "payment_method": "cash", "subtotal": "0", "delivery_fee": "0", "total": "0",
        });
        assert!(serde_json::from_value::<CheckoutRequest>(zero).is_err());

        let mut req = request(json!([{ "medicine_id": Uuid::now_v7(), "pharmacy_id": Uuid::now_v7(), "quantity": 1 }]));
        req.delivery_fee = Decimal::new(-1, 0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_paymob_alias_selects_gateway() {
        let req: CheckoutRequest = serde_json::from_value(json!({
            "items": [{ "medicine_id": Uuid::now_v7(), "pharmacy_id": Uuid::now_v7(), "quantity": 1 }],
            "payment_method": "paymob", "subtotal": "1", "delivery_fee": "0", "total": "1",
        }))
        .unwrap();
        assert!(req.payment_method.is_gateway());
    }
}
