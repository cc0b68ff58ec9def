#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use sehaty_orders::domain::aggregates::{Availability, Cart, CartItem, Delivery, Order, OrderItem, PaymentMethod, PharmacyMedicine, StockRecord};
use sehaty_orders::domain::value_objects::{Address, Quantity};
use sehaty_orders::payment::client::BillingData;
use sehaty_orders::payment::{FieldScope, GatewayError, PaymentGateway, SignatureVerifier, TransactionStatus};
use sehaty_orders::service::{CheckoutItem, CheckoutRequest};
use sehaty_orders::store::{CartStore, CatalogStore, DeliveryStore, MemoryStore, OrderQuery, OrderRepository, StoreError, StoreResult};
use sehaty_orders::{OrderService, Principal, ServiceSettings};

pub const SECRET: &str = "test-hmac-secret";
pub const SCHEME: &str = "sehaty";

/// Scripted gateway: hands out sessions, answers polls from a table.
#[derive(Default)]
pub struct FakeGateway {
    pub fail_sessions: AtomicBool,
    pub sessions: Mutex<Vec<(Uuid, i64)>>,
    pub transactions: Mutex<HashMap<String, TransactionStatus>>,
    pub webhooks: Mutex<Vec<String>>,
    /// Transaction ids the service asked about, in order.
    pub polls: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn settle(&self, transaction_id: &str, order_id: Uuid, success: bool, amount_cents: i64) {
        self.transactions.lock().unwrap().insert(
            transaction_id.to_string(),
            TransactionStatus {
                transaction_id: transaction_id.to_string(),
                success,
                pending: false,
                amount_cents: Some(amount_cents),
                merchant_order_id: Some(order_id.to_string()),
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn authenticate(&self) -> Result<String, GatewayError> { Ok("token".into()) }

    async fn create_remote_order(&self, order_id: Uuid, amount_cents: i64) -> Result<String, GatewayError> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(GatewayError::Status { endpoint: "orders", status: 503, body: "unavailable".into() });
        }
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push((order_id, amount_cents));
        Ok(format!("remote-{}", sessions.len()))
    }

    async fn request_payment_key(&self, remote_order_id: &str, _amount_cents: i64, _billing: &BillingData, _return_url: &str) -> Result<String, GatewayError> {
        Ok(format!("key-{remote_order_id}"))
    }

    async fn register_webhook(&self, callback_url: &str) -> Result<Value, GatewayError> {
        self.webhooks.lock().unwrap().push(callback_url.to_string());
        Ok(json!({ "url": callback_url }))
    }

    async fn verify_payment_status(&self, transaction_id: &str) -> Result<TransactionStatus, GatewayError> {
        self.polls.lock().unwrap().push(transaction_id.to_string());
        self.transactions.lock().unwrap().get(transaction_id).cloned().ok_or(GatewayError::MissingField("transaction"))
    }

    fn payment_url(&self, payment_key: &str) -> String { format!("https://pay.test/iframes/1?payment_token={payment_key}") }
    fn iframe_id(&self) -> &str { "1" }
    fn integration_id(&self) -> &str { "2" }
}

pub struct Harness {
    pub store: MemoryStore,
    pub gateway: Arc<FakeGateway>,
    pub service: OrderService,
    pub medicine: Uuid,
    pub pharmacy: Uuid,
    pub customer: Principal,
}

/// Service wired to `store` with the test secret and settings.
pub fn service_over<S>(store: S, gateway: Arc<FakeGateway>) -> OrderService
where
    S: OrderRepository + CatalogStore + DeliveryStore + CartStore + Clone + 'static,
{
    OrderService::new(
        store,
        gateway,
        SignatureVerifier::new(SECRET),
        ServiceSettings { deep_link_scheme: SCHEME.into(), callback_url: "https://api.test/api/payments/paymob/callback".into() },
    )
}

/// One medicine at one pharmacy, priced 10.00, with `stock` units.
pub async fn harness(stock: u32) -> Harness {
    let store = MemoryStore::new();
    let gateway = Arc::new(FakeGateway::default());
    let (medicine, pharmacy) = (Uuid::now_v7(), Uuid::now_v7());
    store.upsert_pharmacy_medicine(PharmacyMedicine::new(pharmacy, medicine, stock, Decimal::new(1000, 2))).await;
    let service = service_over(store.clone(), gateway.clone());
    Harness { store, gateway, service, medicine, pharmacy, customer: Principal::user(Uuid::now_v7()) }
}

impl Harness {
    pub fn request(&self, method: &str, quantity: u32) -> CheckoutRequest {
        let subtotal = Decimal::new(1000, 2) * Decimal::from(quantity);
        let delivery_fee = Decimal::new(200, 2);
        CheckoutRequest {
            items: vec![CheckoutItem { medicine_id: self.medicine, pharmacy_id: self.pharmacy, quantity: Quantity::new(quantity).unwrap() }],
            address: Address { city: Some("Cairo".into()), ..Address::default() },
            payment_method: PaymentMethod::from(method.to_string()),
            subtotal,
            delivery_fee,
            total: subtotal + delivery_fee,
            customer: Default::default(),
        }
    }

    pub async fn stock(&self) -> u32 { self.store.stock_of(self.medicine, self.pharmacy).await.unwrap() }

    pub async fn fill_cart(&self) {
        let mut cart = Cart::new(self.customer.user_id);
        cart.add_item(CartItem { medicine_id: self.medicine, pharmacy_id: self.pharmacy, quantity: 2, price: Decimal::new(1000, 2) });
        CartStore::save(&self.store, &cart).await.unwrap();
    }

    pub async fn cart_len(&self) -> usize {
        CartStore::get(&self.store, self.customer.user_id).await.unwrap().map(|c| c.item_count()).unwrap_or(0)
    }
}

/// Shares a [`MemoryStore`]'s data but fails selected writes once when armed.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Fails the next save of an order that records committed stock.
    pub fail_committed_save: Arc<AtomicBool>,
    /// Fails the next cart clear.
    pub fail_cart_clear: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn over(store: &MemoryStore) -> Self { Self { inner: store.clone(), ..Self::default() } }
}

fn outage() -> StoreError { StoreError::Corrupt("simulated outage".into()) }

#[async_trait]
impl CatalogStore for FlakyStore {
    async fn find_availability(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<Availability>> {
        self.inner.find_availability(medicine_id, pharmacy_id).await
    }
    async fn adjust_stock(&self, medicine_id: Uuid, pharmacy_id: Uuid, delta: i64) -> StoreResult<u32> {
        self.inner.adjust_stock(medicine_id, pharmacy_id, delta).await
    }
    async fn commit_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool> {
        self.inner.commit_order_stock(order_id, items).await
    }
    async fn release_order_stock(&self, order_id: Uuid, items: &[OrderItem]) -> StoreResult<bool> {
        self.inner.release_order_stock(order_id, items).await
    }
    async fn find_stock_record(&self, medicine_id: Uuid, pharmacy_id: Uuid) -> StoreResult<Option<StockRecord>> {
        self.inner.find_stock_record(medicine_id, pharmacy_id).await
    }
}

#[async_trait]
impl OrderRepository for FlakyStore {
    async fn insert(&self, order: &Order) -> StoreResult<()> { self.inner.insert(order).await }
    async fn find(&self, id: Uuid) -> StoreResult<Option<Order>> { OrderRepository::find(&self.inner, id).await }
    async fn find_by_checkout_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<Order>> {
        self.inner.find_by_checkout_key(user_id, key).await
    }
    async fn update(&self, order: &mut Order) -> StoreResult<()> {
        if order.stock_committed() && self.fail_committed_save.swap(false, Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.update(order).await
    }
    async fn list_for_user(&self, user_id: Uuid, query: &OrderQuery) -> StoreResult<(Vec<Order>, u64)> {
        self.inner.list_for_user(user_id, query).await
    }
}

#[async_trait]
impl DeliveryStore for FlakyStore {
    async fn create_if_absent(&self, order_id: Uuid) -> StoreResult<(Delivery, bool)> { self.inner.create_if_absent(order_id).await }
    async fn find_by_order(&self, order_id: Uuid) -> StoreResult<Option<Delivery>> { self.inner.find_by_order(order_id).await }
    async fn save(&self, delivery: &Delivery) -> StoreResult<()> { DeliveryStore::save(&self.inner, delivery).await }
}

#[async_trait]
impl CartStore for FlakyStore {
    async fn get(&self, user_id: Uuid) -> StoreResult<Option<Cart>> { CartStore::get(&self.inner, user_id).await }
    async fn save(&self, cart: &Cart) -> StoreResult<()> { CartStore::save(&self.inner, cart).await }
    async fn clear(&self, user_id: Uuid) -> StoreResult<()> {
        if self.fail_cart_clear.swap(false, Ordering::SeqCst) {
            return Err(outage());
        }
        self.inner.clear(user_id).await
    }
}

/// Signed server webhook as the gateway would post it.
pub fn webhook(order_id: Uuid, transaction_id: i64, success: bool, pending: bool, amount_cents: i64) -> Value {
    let mut obj: Map<String, Value> = json!({
        "id": transaction_id,
        "pending": pending,
        "success": success,
        "amount_cents": amount_cents,
        "currency": "EGP",
        "created_at": "2024-05-01T10:00:00.000000",
        "is_3d_secure": true,
        "integration_id": 2,
        "order": { "id": 555, "merchant_order_id": order_id.to_string() },
        "source_data": { "pan": "2346", "sub_type": "MasterCard", "type": "card" },
    })
    .as_object()
    .cloned()
    .unwrap();
    let signature = SignatureVerifier::new(SECRET).sign_callback(&obj, FieldScope::ServerWebhook);
    obj.insert("hmac".into(), Value::String(signature));
    json!({ "type": "TRANSACTION", "obj": obj })
}

/// Redirect query string signed with the fixed-order scheme.
pub fn redirect_query(order_id: Uuid, transaction_id: i64, success: bool, amount_cents: i64) -> HashMap<String, String> {
    let mut query: HashMap<String, String> = [
        ("id", transaction_id.to_string()),
        ("pending", "false".to_string()),
        ("success", success.to_string()),
        ("amount_cents", amount_cents.to_string()),
        ("currency", "EGP".to_string()),
        ("order", "555".to_string()),
        ("merchant_order_id", order_id.to_string()),
        ("source_data.pan", "2346".to_string()),
        ("source_data.type", "card".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let fields: Map<String, Value> = query.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    query.insert("hmac".into(), SignatureVerifier::new(SECRET).sign_redirect(&fields));
    query
}
