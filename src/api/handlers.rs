use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

use super::AppState;
use crate::domain::aggregates::{Order, OrderStatus};
use crate::error::{OrderError, Result};
use crate::service::{CheckoutReceipt, CheckoutRequest, OrderDetail, OrderPage, PaymentStatusView, Principal};
use crate::store::OrderQuery;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

fn parse_status(raw: &str) -> Result<OrderStatus> {
    OrderStatus::parse(raw.trim()).ok_or_else(|| OrderError::Validation(format!("unknown order status `{raw}`")))
}

pub async fn checkout(
    State(s): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    Json(r): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutReceipt>)> {
    let key = headers.get(IDEMPOTENCY_KEY_HEADER).and_then(|v| v.to_str().ok()).map(String::from);
    let receipt = s.orders.checkout(&principal, r, key).await?;
    let status = if receipt.replayed { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams { pub page: Option<u32>, pub limit: Option<u32>, pub status: Option<String> }

pub async fn list_orders(State(s): State<AppState>, principal: Principal, Query(p): Query<ListParams>) -> Result<Json<OrderPage>> {
    let defaults = OrderQuery::default();
    let status = p.status.as_deref().filter(|v| !v.trim().is_empty()).map(parse_status).transpose()?;
    let query = OrderQuery { page: p.page.unwrap_or(defaults.page), limit: p.limit.unwrap_or(defaults.limit), status };
    Ok(Json(s.orders.list_orders(&principal, query).await?))
}

pub async fn get_order(State(s): State<AppState>, principal: Principal, Path(id): Path<Uuid>) -> Result<Json<OrderDetail>> {
    Ok(Json(s.orders.get_order(&principal, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest { pub status: String }

pub async fn update_status(
    State(s): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(r): Json<UpdateStatusRequest>,
) -> Result<Json<Order>> {
    let next = parse_status(&r.status)?;
    Ok(Json(s.orders.update_status(&principal, id, next).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams { #[serde(default)] pub archive: bool }

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest { #[serde(alias = "cancellationReason")] pub cancellation_reason: Option<String> }

pub async fn cancel_order(
    State(s): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Query(p): Query<CancelParams>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<serde_json::Value>> {
    let reason = body.and_then(|Json(r)| r.cancellation_reason).filter(|r| !r.trim().is_empty());
    let order = s.orders.cancel(&principal, id, reason, p.archive).await?;
    Ok(Json(serde_json::json!({ "message": "Order cancelled successfully", "order": order })))
}

pub async fn verify_payment(State(s): State<AppState>, principal: Principal, Path(id): Path<Uuid>) -> Result<Json<PaymentStatusView>> {
    Ok(Json(s.orders.verify_payment(&principal, id).await?))
}

pub async fn register_webhook(State(s): State<AppState>, principal: Principal) -> Result<Json<serde_json::Value>> {
    let data = s.orders.register_webhook(&principal).await?;
    Ok(Json(serde_json::json!({ "success": true, "message": "Webhook registered successfully", "data": data })))
}

/// Gateway webhook. Takes the raw body so a malformed payload is answered
/// by us rather than by the JSON extractor.
pub async fn payment_webhook(State(s): State<AppState>, Query(q): Query<HashMap<String, String>>, body: Bytes) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse payment webhook JSON");
            return OrderError::Validation("webhook body is not valid JSON".into()).into_response();
        }
    };
    match s.orders.handle_webhook(&payload, q.get("hmac").map(String::as_str)).await {
        Ok(outcome) => Json(serde_json::json!({ "received": true, "outcome": outcome })).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Customer redirect from the hosted payment page; always answers with a redirect.
pub async fn payment_redirect(State(s): State<AppState>, Query(q): Query<HashMap<String, String>>) -> Redirect {
    Redirect::to(&s.orders.handle_redirect(&q).await)
}
