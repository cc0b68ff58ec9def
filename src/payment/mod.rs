//! Payment gateway integration: REST client, callback parsing and signatures

pub mod client;
pub mod signature;

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub use client::{is_transaction_id, BillingData, CustomerProfile, PaymentGateway, PaymentSession, PaymobClient, TransactionStatus};
pub use signature::{FieldScope, SignatureVerifier};

use client::{id_field, int_field, truthy};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status { endpoint: &'static str, status: u16, body: String },

    #[error("response is missing `{0}`")]
    MissingField(&'static str),

    #[error("not a gateway transaction id: {0:?}")]
    InvalidTransactionId(String),
}

/// Normalised view of an inbound callback, webhook or redirect.
#[derive(Clone, Debug, PartialEq)]
pub struct CallbackData {
    pub transaction_id: Option<String>,
    pub merchant_order_id: Option<String>,
    pub success: bool,
    pub pending: bool,
    pub amount_cents: Option<i64>,
    pub signature: Option<String>,
    /// Raw fields as signed by the gateway.
    pub fields: Map<String, Value>,
}

impl CallbackData {
    /// Webhook bodies arrive as `{"type": "TRANSACTION", "obj": {...}}`. The
    /// signature is read from `obj.hmac`, falling back to the `hmac` query parameter.
    pub fn from_webhook(body: &Value, query_hmac: Option<&str>) -> Option<Self> {
        let fields = body.get("obj").unwrap_or(body).as_object()?.clone();
        let merchant_order_id = fields
            .get("merchant_order_id")
            .and_then(id_field)
            .or_else(|| fields.get("order").and_then(|o| o.get("merchant_order_id")).and_then(id_field));
        let signature = fields.get("hmac").and_then(Value::as_str).map(String::from).or_else(|| query_hmac.map(String::from));
        Some(Self {
            transaction_id: fields.get("id").and_then(id_field),
            merchant_order_id,
            success: truthy(fields.get("success")),
            pending: truthy(fields.get("pending")),
            amount_cents: int_field(fields.get("amount_cents")),
            signature,
            fields,
        })
    }

    /// Redirects carry every field flat in the query string.
    pub fn from_redirect(query: &HashMap<String, String>) -> Self {
        let fields: Map<String, Value> = query.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
        Self {
            transaction_id: fields.get("id").and_then(id_field),
            merchant_order_id: fields.get("merchant_order_id").and_then(id_field),
            success: truthy(fields.get("success")),
            pending: truthy(fields.get("pending")),
            amount_cents: int_field(fields.get("amount_cents")),
            signature: query.get("hmac").cloned(),
            fields,
        }
    }
}
