//! Payment reconciliation: webhooks, customer redirects and manual polls
//!
//! All three paths funnel into [`OrderService::apply_report`]. Confirmation is
//! guarded by `is_paid`, stock commits are keyed by order id and deliveries are
//! insert-if-absent, so any number of deliveries of the same notification
//! leave the order, stock and delivery exactly as the first one did.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::{OrderService, Principal};
use crate::domain::aggregates::{GatewayPaymentStatus, Order, OrderStatus, PaymentOutcome};
use crate::domain::value_objects::{to_minor_units, DeepLink};
use crate::error::{OrderError, Result};
use crate::payment::{is_transaction_id, CallbackData, FieldScope, TransactionStatus};

/// How an inbound payment notification was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Confirmed,
    AlreadyPaid,
    /// Captured after the order was cancelled; a refund was queued.
    PaidAfterCancel,
    Declined,
    Pending,
    AmountMismatch,
    UnknownOrder,
    /// Redirect whose signature failed and which could not be checked with the gateway.
    Unverified,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentStatusView {
    pub order_id: Uuid,
    pub is_paid: bool,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<GatewayPaymentStatus>,
}

impl From<&Order> for PaymentStatusView {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            is_paid: order.is_paid(),
            status: order.status(),
            payment_status: order.gateway().map(|g| g.payment_status),
        }
    }
}

/// What one trusted source says about a transaction.
#[derive(Clone, Debug)]
struct PaymentReport {
    order_id: Option<Uuid>,
    transaction_id: Option<String>,
    success: bool,
    pending: bool,
    amount_cents: Option<i64>,
}

fn parse_order_id(raw: Option<&str>) -> Option<Uuid> { raw.and_then(|s| Uuid::parse_str(s.trim()).ok()) }

impl From<&CallbackData> for PaymentReport {
    fn from(cb: &CallbackData) -> Self {
        Self {
            order_id: parse_order_id(cb.merchant_order_id.as_deref()),
            transaction_id: cb.transaction_id.clone(),
            success: cb.success,
            pending: cb.pending,
            amount_cents: cb.amount_cents,
        }
    }
}

impl From<&TransactionStatus> for PaymentReport {
    fn from(status: &TransactionStatus) -> Self {
        Self {
            order_id: parse_order_id(status.merchant_order_id.as_deref()),
            transaction_id: Some(status.transaction_id.clone()),
            success: status.success,
            pending: status.pending,
            amount_cents: status.amount_cents,
        }
    }
}

impl OrderService {
    /// Server-to-server notification. Fails closed on a bad or missing signature.
    ///
    /// Anomalies the gateway cannot fix by retrying (unknown order, amount
    /// mismatch) are logged and reported as handled.
    pub async fn handle_webhook(&self, body: &Value, query_hmac: Option<&str>) -> Result<CallbackOutcome> {
        let callback = CallbackData::from_webhook(body, query_hmac)
            .ok_or_else(|| OrderError::Validation("webhook body must carry a transaction object".into()))?;
        let signature = callback.signature.as_deref().ok_or(OrderError::InvalidSignature)?;
        if let Err(e) = self.signatures.verify_callback_signature(signature, &callback.fields, FieldScope::ServerWebhook) {
            tracing::warn!(transaction_id = ?callback.transaction_id, merchant_order_id = ?callback.merchant_order_id, "Rejected webhook with invalid signature");
            return Err(e);
        }
        tracing::info!(transaction_id = ?callback.transaction_id, success = callback.success, "Received payment webhook");
        self.apply_report(PaymentReport::from(&callback)).await
    }

    /// Customer returning from the hosted payment page. Never fails: the
    /// result is always a URL to send the customer to.
    ///
    /// A redirect whose signature does not verify is not trusted for its own
    /// fields; when it names a transaction the gateway is asked instead.
    pub async fn handle_redirect(&self, query: &HashMap<String, String>) -> String {
        let callback = CallbackData::from_redirect(query);
        let raw_order_id = callback.merchant_order_id.clone().unwrap_or_default();
        let verified = callback
            .signature
            .as_deref()
            .is_some_and(|sig| self.signatures.verify_redirect_signature(sig, &callback.fields).is_ok());

        let report = if verified {
            Some(PaymentReport::from(&callback))
        } else {
            tracing::warn!(merchant_order_id = %raw_order_id, "Redirect signature did not verify");
            self.poll_for_redirect(&callback).await
        };
        let outcome = match report {
            Some(report) => self.apply_report(report).await,
            None => Ok(CallbackOutcome::Unverified),
        };
        match outcome {
            Ok(outcome) => tracing::info!(merchant_order_id = %raw_order_id, ?outcome, "Payment redirect handled"),
            Err(e) => tracing::error!(merchant_order_id = %raw_order_id, error = %e, "Payment redirect processing failed"),
        }
        self.redirect_target(&raw_order_id).await
    }

    async fn poll_for_redirect(&self, callback: &CallbackData) -> Option<PaymentReport> {
        let transaction_id = callback.transaction_id.as_deref()?;
        if !is_transaction_id(transaction_id) {
            tracing::warn!(transaction_id, "Redirect carries a malformed transaction id, not polling");
            return None;
        }
        match self.gateway.verify_payment_status(transaction_id).await {
            Ok(status) => Some(PaymentReport::from(&status)),
            Err(e) => {
                tracing::warn!(transaction_id, error = %e, "Could not verify redirect with the gateway");
                None
            }
        }
    }

    /// Stored return URL once paid, otherwise the app deep link.
    async fn redirect_target(&self, raw_order_id: &str) -> String {
        let fallback = DeepLink::payment_complete(&self.settings.deep_link_scheme, raw_order_id).into_string();
        let Some(order_id) = parse_order_id(Some(raw_order_id)) else { return fallback };
        match self.orders.find(order_id).await {
            Ok(Some(order)) if order.is_paid() => order.gateway().and_then(|g| g.return_url.clone()).unwrap_or(fallback),
            Ok(_) => fallback,
            Err(e) => {
                tracing::warn!(%order_id, error = %e, "Could not load order for redirect");
                fallback
            }
        }
    }

    /// Manual reconciliation by the order owner: polls the gateway for the
    /// stored transaction and applies the authoritative result.
    pub async fn verify_payment(&self, principal: &Principal, order_id: Uuid) -> Result<PaymentStatusView> {
        let order = self.load_for(principal, order_id, false).await?;
        if !order.payment_method().is_gateway() || order.is_paid() {
            return Ok(PaymentStatusView::from(&order));
        }
        let Some(transaction_id) = order.gateway().and_then(|g| g.transaction_id.clone()) else {
            return Ok(PaymentStatusView::from(&order));
        };
        let status = self.gateway.verify_payment_status(&transaction_id).await?;
        let report = PaymentReport { order_id: Some(order_id), ..PaymentReport::from(&status) };
        let outcome = self.apply_report(report).await?;
        tracing::info!(%order_id, ?outcome, "Payment verified with gateway");
        Ok(PaymentStatusView::from(&self.load(order_id).await?))
    }

    /// Registers this service's callback URL with the gateway. Admin only.
    pub async fn register_webhook(&self, principal: &Principal) -> Result<Value> {
        if !principal.is_admin() { return Err(OrderError::NotAuthorized); }
        let result = self.gateway.register_webhook(&self.settings.callback_url).await?;
        tracing::info!(callback_url = %self.settings.callback_url, "Payment webhook registered");
        Ok(result)
    }

    async fn apply_report(&self, report: PaymentReport) -> Result<CallbackOutcome> {
        let Some(order_id) = report.order_id else {
            tracing::error!(transaction_id = ?report.transaction_id, "Payment notification without a usable merchant order id");
            return Ok(CallbackOutcome::UnknownOrder);
        };
        let Some(order) = self.orders.find(order_id).await? else {
            tracing::error!(%order_id, transaction_id = ?report.transaction_id, "Payment notification for unknown order");
            return Ok(CallbackOutcome::UnknownOrder);
        };

        if report.pending {
            if let Some(transaction_id) = report.transaction_id {
                self.mutate(order_id, |o| {
                    o.record_transaction(transaction_id.clone());
                    Ok(())
                })
                .await?;
            }
            return Ok(CallbackOutcome::Pending);
        }

        if !report.success {
            if order.is_paid() { return Ok(CallbackOutcome::AlreadyPaid); }
            let (_, changed) = self.mutate(order_id, |o| Ok(o.fail_payment(report.transaction_id.clone(), "declined by gateway"))).await?;
            if changed { tracing::info!(%order_id, "Payment declined"); }
            return Ok(CallbackOutcome::Declined);
        }

        if let Some(cents) = report.amount_cents {
            if to_minor_units(order.total()) != Some(cents) {
                tracing::error!(%order_id, amount_cents = cents, total = %order.total(), "Captured amount does not match order total, not confirming");
                return Ok(CallbackOutcome::AmountMismatch);
            }
        }
        self.confirm_paid(order_id, report.transaction_id).await
    }

    async fn confirm_paid(&self, order_id: Uuid, transaction_id: Option<String>) -> Result<CallbackOutcome> {
        let (order, outcome) = self.mutate(order_id, |o| Ok(o.confirm_payment(transaction_id.clone()))).await?;
        match outcome {
            PaymentOutcome::PaidAfterCancel => {
                tracing::warn!(%order_id, refund_amount = ?order.refund_amount(), "Payment captured for a cancelled order, refund queued");
                return Ok(CallbackOutcome::PaidAfterCancel);
            }
            PaymentOutcome::Confirmed => tracing::info!(%order_id, "Payment confirmed"),
            PaymentOutcome::AlreadyPaid => tracing::debug!(%order_id, "Payment already applied"),
        }
        match self.fulfil(order).await {
            Ok(_) => {}
            Err(e @ (OrderError::InsufficientStock { .. } | OrderError::ItemUnavailable { .. })) => {
                tracing::error!(%order_id, error = %e, "Paid order cannot be fulfilled from current stock");
            }
            Err(e) => return Err(e),
        }
        Ok(if outcome == PaymentOutcome::Confirmed { CallbackOutcome::Confirmed } else { CallbackOutcome::AlreadyPaid })
    }

    /// Effects of a paid order: stock commit, delivery, cart. Each step is
    /// idempotent so a partially applied run is finished by the next call.
    pub(super) async fn fulfil(&self, order: Order) -> Result<Order> {
        let order_id = order.id();
        let mut order = order;
        if order.needs_fulfilment() {
            if self.catalog.commit_order_stock(order_id, order.items()).await? {
                tracing::info!(%order_id, "Stock committed");
            }
            let (updated, live) = self
                .mutate(order_id, |o| {
                    if o.status() == OrderStatus::Cancelled { return Ok(false); }
                    o.mark_stock_committed();
                    Ok(true)
                })
                .await?;
            if !live {
                // cancelled while stock was being taken
                if self.catalog.release_order_stock(order_id, updated.items()).await? {
                    tracing::info!(%order_id, "Stock released for order cancelled during confirmation");
                }
                return Ok(updated);
            }
            order = updated;
        }

        if order.stock_committed() && order.status() != OrderStatus::Cancelled {
            let (delivery, created) = self.deliveries.create_if_absent(order_id).await?;
            if created {
                tracing::info!(%order_id, delivery_id = %delivery.id, "Delivery created");
            }
            // recorded on the order so a replay never empties a cart refilled since
            if !order.cart_cleared() {
                self.carts.clear(order.user_id()).await?;
                let (updated, ()) = self.mutate(order_id, |o| {
                    o.mark_cart_cleared();
                    Ok(())
                })
                .await?;
                order = updated;
            }
        }
        Ok(order)
    }
}
