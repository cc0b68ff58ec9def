//! HTTP surface

pub mod auth;
mod handlers;

use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::CALLBACK_PATH;
use crate::service::OrderService;

#[derive(Clone)]
pub struct AppState {
    pub orders: OrderService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "sehaty-orders"})) }))
        .route("/api/orders", get(handlers::list_orders).post(handlers::checkout))
        .route("/api/orders/:id", get(handlers::get_order).delete(handlers::cancel_order))
        .route("/api/orders/:id/status", patch(handlers::update_status))
        .route("/api/orders/:id/payment", get(handlers::verify_payment))
        .route("/api/orders/paymob/webhook/register", post(handlers::register_webhook))
        .route(CALLBACK_PATH, get(handlers::payment_redirect).post(handlers::payment_webhook))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(state)
}
