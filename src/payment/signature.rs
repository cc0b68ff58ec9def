//! Callback signature schemes (HMAC-SHA512, hex encoded)
//!
//! The gateway signs its two callback types differently:
//!
//! - **Webhook / field-driven**: every field except `hmac` (server webhooks
//!   also drop `created_at` and `is_3d_secure`), sorted by key in locale
//!   order, rendered as `key=value` and concatenated. Values are rendered the
//!   way the gateway's reference integration stringifies them: nested objects
//!   become `[object Object]` and arrays are comma-joined.
//! - **Redirect / fixed-order**: the values of a provider-defined list of
//!   fields, in that order, preceded by the literal object type token. Nested
//!   fields are addressed by dot path (`source_data.pan`).
//!
//! The two are kept as separate algorithms; a payload valid under one is in
//! general not valid under the other.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha512;
use std::cmp::Ordering;

use crate::error::{OrderError, Result};

type HmacSha512 = Hmac<Sha512>;

/// Which fields the field-driven scheme drops besides `hmac`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldScope {
    /// Server-initiated webhook: also drops `created_at` and `is_3d_secure`.
    ServerWebhook,
    /// Every field but `hmac`.
    AllFields,
}

impl FieldScope {
    fn excludes(&self, key: &str) -> bool {
        match self {
            Self::ServerWebhook => matches!(key, "hmac" | "created_at" | "is_3d_secure"),
            Self::AllFields => key == "hmac",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignedPart { Literal(&'static str), Field(&'static str) }

/// Fixed concatenation order for redirect signatures.
const REDIRECT_PARTS: &[SignedPart] = &[
    SignedPart::Literal("TRANSACTION"),
    SignedPart::Field("amount_cents"),
    SignedPart::Field("created_at"),
    SignedPart::Field("currency"),
    SignedPart::Field("error_occured"),
    SignedPart::Field("has_parent_transaction"),
    SignedPart::Field("id"),
    SignedPart::Field("integration_id"),
    SignedPart::Field("is_3d_secure"),
    SignedPart::Field("is_auth"),
    SignedPart::Field("is_capture"),
    SignedPart::Field("is_refunded"),
    SignedPart::Field("is_standalone_payment"),
    SignedPart::Field("is_voided"),
    SignedPart::Field("order"),
    SignedPart::Field("owner"),
    SignedPart::Field("pending"),
    SignedPart::Field("source_data.pan"),
    SignedPart::Field("source_data.sub_type"),
    SignedPart::Field("source_data.type"),
    SignedPart::Field("success"),
];

/// String form of a callback value inside a signed message.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) => f.to_string(),
            _ => n.to_string(),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| if item.is_null() { String::new() } else { render(item) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Punctuation, then digits, then letters; letters compare case-insensitively.
fn collation_key(c: char) -> (u8, char) {
    if c.is_alphabetic() {
        (2, c.to_lowercase().next().unwrap_or(c))
    } else if c.is_ascii_digit() {
        (1, c)
    } else {
        (0, c)
    }
}

/// Locale-style key order. Keys equal but for case put the lowercase one first.
fn collation_cmp(a: &str, b: &str) -> Ordering {
    a.chars().map(collation_key).cmp(b.chars().map(collation_key)).then_with(|| b.cmp(a))
}

/// Dot-path lookup. A flat key that literally contains the dots wins over nesting.
fn lookup<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = fields.get(path) { return Some(v); }
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Message signed under the field-driven scheme.
pub fn field_driven_message(fields: &Map<String, Value>, scope: FieldScope) -> String {
    let mut entries: Vec<(&String, &Value)> = fields.iter().filter(|(k, _)| !scope.excludes(k)).collect();
    entries.sort_by(|(a, _), (b, _)| collation_cmp(a, b));
    entries.into_iter().map(|(k, v)| format!("{k}={}", render(v))).collect()
}

/// Message signed under the fixed-order redirect scheme. Missing fields contribute nothing.
pub fn fixed_order_message(fields: &Map<String, Value>) -> String {
    REDIRECT_PARTS
        .iter()
        .map(|part| match part {
            SignedPart::Literal(token) => (*token).to_string(),
            SignedPart::Field(path) => match lookup(fields, path) {
                // the redirect carries the order id flat, the webhook nests it
                Some(Value::Object(o)) if *path == "order" => o.get("id").map(render).unwrap_or_default(),
                Some(v) => render(v),
                None => String::new(),
            },
        })
        .collect()
}

fn mac(secret: &str, message: &str) -> std::result::Result<HmacSha512, hmac::digest::InvalidLength> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())?;
    mac.update(message.as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA512 of `message`.
pub fn sign(secret: &str, message: &str) -> String {
    mac(secret, message).map(|m| hex::encode(m.finalize().into_bytes())).unwrap_or_default()
}

/// Constant-time comparison against a hex signature.
fn verify(secret: &str, message: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else { return false };
    mac(secret, message).map(|m| m.verify_slice(&expected).is_ok()).unwrap_or(false)
}

/// Verifies both callback schemes with one shared secret.
#[derive(Clone)]
pub struct SignatureVerifier { secret: String }

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("SignatureVerifier").finish_non_exhaustive() }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self { Self { secret: secret.into() } }

    pub fn verify_callback_signature(&self, signature: &str, fields: &Map<String, Value>, scope: FieldScope) -> Result<()> {
        if verify(&self.secret, &field_driven_message(fields, scope), signature) { Ok(()) } else { Err(OrderError::InvalidSignature) }
    }

    pub fn verify_redirect_signature(&self, signature: &str, query_fields: &Map<String, Value>) -> Result<()> {
        if verify(&self.secret, &fixed_order_message(query_fields), signature) { Ok(()) } else { Err(OrderError::InvalidSignature) }
    }

    pub fn sign_callback(&self, fields: &Map<String, Value>, scope: FieldScope) -> String { sign(&self.secret, &field_driven_message(fields, scope)) }
    pub fn sign_redirect(&self, query_fields: &Map<String, Value>) -> String { sign(&self.secret, &fixed_order_message(query_fields)) }
}
