//! Error taxonomy for the order workflow and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::{OrderStatus, TransitionError};
use crate::payment::GatewayError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Medicine {medicine_id} is not available in pharmacy {pharmacy_id}")]
    ItemUnavailable { medicine_id: Uuid, pharmacy_id: Uuid },

    #[error("Insufficient stock for medicine {medicine_id} in pharmacy {pharmacy_id}")]
    InsufficientStock { medicine_id: Uuid, pharmacy_id: Uuid },

    #[error("Declared {field} {declared} does not match calculated {calculated}")]
    TotalMismatch { field: &'static str, declared: Decimal, calculated: Decimal },

    #[error("Invalid callback signature")]
    InvalidSignature,

    #[error("Order not found")]
    OrderNotFound,

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Order in status {0} cannot be cancelled")]
    NotCancellable(OrderStatus),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(TransitionError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Order was modified concurrently")]
    Conflict,

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ItemUnavailable { .. } => "item_unavailable",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::TotalMismatch { .. } => "total_mismatch",
            Self::InvalidSignature => "invalid_signature",
            Self::OrderNotFound => "order_not_found",
            Self::Gateway(_) => "gateway_error",
            Self::Unauthenticated => "unauthenticated",
            Self::NotAuthorized => "not_authorized",
            Self::NotCancellable(_) => "not_cancellable",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Validation(_) => "validation_error",
            Self::Conflict => "conflict",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ItemUnavailable { .. }
            | Self::InsufficientStock { .. }
            | Self::TotalMismatch { .. }
            | Self::NotCancellable(_)
            | Self::InvalidTransition(_)
            | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidSignature | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::OrderNotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for OrderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::OrderNotFound,
            StoreError::Conflict | StoreError::Duplicate => Self::Conflict,
            StoreError::InsufficientStock { medicine_id, pharmacy_id } => Self::InsufficientStock { medicine_id, pharmacy_id },
            StoreError::Unavailable { medicine_id, pharmacy_id } => Self::ItemUnavailable { medicine_id, pharmacy_id },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TransitionError> for OrderError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::NotCancellable(status) => Self::NotCancellable(status),
            TransitionError::NoItems | TransitionError::NegativeAmount => Self::Validation(e.to_string()),
            other => Self::InvalidTransition(other),
        }
    }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(e: validator::ValidationErrors) -> Self { Self::Validation(e.to_string()) }
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Order request failed");
        }
        (status, Json(serde_json::json!({ "error": self.code(), "message": self.to_string() }))).into_response()
    }
}
