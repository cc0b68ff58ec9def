//! Gateway REST client
//!
//! Stateless apart from configuration: each call authenticates on its own and
//! no bearer token outlives the call chain that requested it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::GatewayError;
use crate::config::GatewayConfig;
use crate::domain::value_objects::Address;

/// Billing block the hosted payment page requires; the gateway rejects blanks, hence the placeholders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingData {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub country: String,
    pub city: String,
    pub street: String,
    pub building: String,
    pub floor: String,
    pub apartment: String,
}

/// Customer details passed through checkout for billing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl BillingData {
    pub fn from_customer(customer: &CustomerProfile, address: &Address) -> Self {
        let or = |v: &Option<String>, default: &str| v.clone().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string());
        Self {
            first_name: or(&customer.first_name, "Customer"),
            last_name: or(&customer.last_name, "User"),
            email: or(&customer.email, "customer@example.com"),
            phone_number: or(&customer.phone.clone().or_else(|| address.phone.clone()), "+201000000000"),
            country: "EG".to_string(),
            city: or(&address.city, "Cairo"),
            street: or(&address.street, "N/A"),
            building: or(&address.building, "N/A"),
            floor: or(&address.floor, "N/A"),
            apartment: or(&address.apartment, "N/A"),
        }
    }
}

/// Hosted payment page issued for one local order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentSession {
    pub payment_url: String,
    pub external_order_id: String,
    pub payment_key: String,
}

/// Authoritative transaction state as reported by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionStatus {
    pub transaction_id: String,
    pub success: bool,
    pub pending: bool,
    pub amount_cents: Option<i64>,
    pub merchant_order_id: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Exchanges the API key for a short-lived bearer token.
    async fn authenticate(&self) -> Result<String, GatewayError>;
    /// Creates the gateway-side order; returns its id.
    async fn create_remote_order(&self, order_id: Uuid, amount_cents: i64) -> Result<String, GatewayError>;
    /// Issues a payment token for the hosted page.
    async fn request_payment_key(&self, remote_order_id: &str, amount_cents: i64, billing: &BillingData, return_url: &str) -> Result<String, GatewayError>;
    async fn register_webhook(&self, callback_url: &str) -> Result<Value, GatewayError>;
    async fn verify_payment_status(&self, transaction_id: &str) -> Result<TransactionStatus, GatewayError>;

    fn payment_url(&self, payment_key: &str) -> String;
    fn iframe_id(&self) -> &str;
    fn integration_id(&self) -> &str;

    /// Remote order + payment key + hosted page URL, in that order.
    async fn create_payment_session(&self, order_id: Uuid, amount_cents: i64, billing: &BillingData, return_url: &str) -> Result<PaymentSession, GatewayError> {
        let external_order_id = self.create_remote_order(order_id, amount_cents).await?;
        let payment_key = self.request_payment_key(&external_order_id, amount_cents, billing, return_url).await?;
        Ok(PaymentSession { payment_url: self.payment_url(&payment_key), external_order_id, payment_key })
    }
}

/// Gateway transaction ids are decimal integers. Anything else never reaches a request path.
pub fn is_transaction_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= 20 && s.bytes().all(|b| b.is_ascii_digit())
}

/// Reads an id that the gateway sends either as a number or a string.
pub(crate) fn id_field(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `true`, `"true"` and `"True"` all count; anything else is false.
pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

pub(crate) fn int_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl TransactionStatus {
    pub(crate) fn from_json(transaction_id: &str, body: &Value) -> Self {
        // some endpoints wrap the transaction in `obj`
        let obj = body.get("obj").filter(|o| o.is_object()).unwrap_or(body);
        let merchant_order_id = obj
            .get("merchant_order_id")
            .and_then(id_field)
            .or_else(|| obj.get("order").and_then(|o| o.get("merchant_order_id")).and_then(id_field));
        Self {
            transaction_id: obj.get("id").and_then(id_field).unwrap_or_else(|| transaction_id.to_string()),
            success: truthy(obj.get("success")),
            pending: truthy(obj.get("pending")),
            amount_cents: int_field(obj.get("amount_cents")),
            merchant_order_id,
        }
    }
}

/// reqwest-backed gateway client
#[derive(Clone)]
pub struct PaymobClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl PaymobClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(std::time::Duration::from_secs(20)).build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.config.base_url, path) }

    async fn read(endpoint: &'static str, resp: reqwest::Response) -> Result<Value, GatewayError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Status { endpoint, status: status.as_u16(), body });
        }
        Ok(resp.json().await?)
    }

    async fn post(&self, endpoint: &'static str, path: &str, body: Value) -> Result<Value, GatewayError> {
        let resp = self.http.post(self.url(path)).json(&body).send().await?;
        Self::read(endpoint, resp).await
    }
}

#[async_trait]
impl PaymentGateway for PaymobClient {
    async fn authenticate(&self) -> Result<String, GatewayError> {
        let resp = self.post("auth", "/auth/tokens", json!({ "api_key": self.config.api_key })).await?;
        resp["token"].as_str().map(String::from).ok_or(GatewayError::MissingField("token"))
    }

    async fn create_remote_order(&self, order_id: Uuid, amount_cents: i64) -> Result<String, GatewayError> {
        let token = self.authenticate().await?;
        let resp = self
            .post("orders", "/ecommerce/orders", json!({
                "auth_token": token,
                "delivery_needed": "false",
                "amount_cents": amount_cents.to_string(),
                "currency": self.config.currency,
                "merchant_order_id": order_id.to_string(),
                "items": [],
            }))
            .await?;
        id_field(&resp["id"]).ok_or(GatewayError::MissingField("id"))
    }

    async fn request_payment_key(&self, remote_order_id: &str, amount_cents: i64, billing: &BillingData, return_url: &str) -> Result<String, GatewayError> {
        let token = self.authenticate().await?;
        let resp = self
            .post("payment_keys", "/acceptance/payment_keys", json!({
                "auth_token": token,
                "amount_cents": amount_cents.to_string(),
                "expiration": self.config.key_expiration_secs,
                "order_id": remote_order_id,
                "billing_data": billing,
                "currency": self.config.currency,
                "integration_id": self.config.integration_id,
                "return_url": return_url,
            }))
            .await?;
        resp["token"].as_str().map(String::from).ok_or(GatewayError::MissingField("token"))
    }

    async fn register_webhook(&self, callback_url: &str) -> Result<Value, GatewayError> {
        let token = self.authenticate().await?;
        self.post("webhooks", "/acceptance/webhooks", json!({ "auth_token": token, "url": callback_url })).await
    }

    async fn verify_payment_status(&self, transaction_id: &str) -> Result<TransactionStatus, GatewayError> {
        if !is_transaction_id(transaction_id) {
            return Err(GatewayError::InvalidTransactionId(transaction_id.to_string()));
        }
        let token = self.authenticate().await?;
        let resp = self
            .http
            .get(self.url(&format!("/acceptance/transactions/{transaction_id}/verify")))
            .bearer_auth(token)
            .send()
            .await?;
        let body = Self::read("verify", resp).await?;
        Ok(TransactionStatus::from_json(transaction_id, &body))
    }

    fn payment_url(&self, payment_key: &str) -> String {
        format!("{}/acceptance/iframes/{}?payment_token={}", self.config.base_url, self.config.iframe_id, payment_key)
    }

    fn iframe_id(&self) -> &str { &self.config.iframe_id }
    fn integration_id(&self) -> &str { &self.config.integration_id }
}
