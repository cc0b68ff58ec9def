mod common;

use serde_json::json;
use uuid::Uuid;

use serde_json::{Map, Value};
use std::sync::atomic::Ordering;

use common::{harness, redirect_query, service_over, webhook, FlakyStore, Harness, SECRET};
use sehaty_orders::domain::aggregates::{GatewayPaymentStatus, Order, OrderStatus, RefundStatus};
use sehaty_orders::payment::{FieldScope, SignatureVerifier};
use sehaty_orders::service::CallbackOutcome;
use sehaty_orders::store::{DeliveryStore, OrderRepository};
use sehaty_orders::{OrderError, Principal};

async fn gateway_order(h: &Harness, quantity: u32) -> Order {
    h.fill_cart().await;
    h.service.checkout(&h.customer, h.request("gateway", quantity), None).await.unwrap().order
}

async fn reload(h: &Harness, id: Uuid) -> Order { OrderRepository::find(&h.store, id).await.unwrap().unwrap() }

#[tokio::test]
async fn test_webhook_confirms_once_across_replays() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let body = webhook(order.id(), 9001, true, false, 2200);

    let outcome = h.service.handle_webhook(&body, None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Confirmed);
    for _ in 0..3 {
        assert_eq!(h.service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::AlreadyPaid);
    }

    let stored = reload(&h, order.id()).await;
    assert!(stored.is_paid());
    assert!(stored.stock_committed());
    assert_eq!(stored.status(), OrderStatus::Confirmed);
    let gateway = stored.gateway().unwrap();
    assert_eq!(gateway.payment_status, GatewayPaymentStatus::Paid);
    assert_eq!(gateway.transaction_id.as_deref(), Some("9001"));

    assert_eq!(h.stock().await, 3);
    assert_eq!(h.store.delivery_count().await, 1);
    assert_eq!(h.cart_len().await, 0);
}

#[tokio::test]
async fn test_tampered_or_unsigned_webhook_is_rejected() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    let mut tampered = webhook(order.id(), 9001, true, false, 2200);
    tampered["obj"]["amount_cents"] = json!(100);
    let err = h.service.handle_webhook(&tampered, None).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidSignature));

    let mut unsigned = webhook(order.id(), 9001, true, false, 2200);
    unsigned["obj"].as_object_mut().unwrap().remove("hmac");
    let err = h.service.handle_webhook(&unsigned, None).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidSignature));

    let stored = reload(&h, order.id()).await;
    assert!(!stored.is_paid());
    assert_eq!(stored.status(), OrderStatus::PaymentPending);
    assert_eq!(h.stock().await, 5);
}

#[tokio::test]
async fn test_signature_from_query_parameter() {
    let h = harness(5).await;
    let order = gateway_order(&h, 1).await;
    let mut body = webhook(order.id(), 9002, true, false, 1200);
    let signature = body["obj"].as_object_mut().unwrap().remove("hmac").unwrap();

    let outcome = h.service.handle_webhook(&body, signature.as_str()).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Confirmed);
}

#[tokio::test]
async fn test_webhook_for_unknown_order_is_acknowledged() {
    let h = harness(5).await;
    let outcome = h.service.handle_webhook(&webhook(Uuid::now_v7(), 1, true, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::UnknownOrder);
    assert_eq!(h.stock().await, 5);
}

#[tokio::test]
async fn test_amount_mismatch_does_not_confirm() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let outcome = h.service.handle_webhook(&webhook(order.id(), 9001, true, false, 100), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::AmountMismatch);

    let stored = reload(&h, order.id()).await;
    assert!(!stored.is_paid());
    assert_eq!(h.stock().await, 5);
    assert_eq!(h.store.delivery_count().await, 0);
}

#[tokio::test]
async fn test_decline_then_late_success() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    let outcome = h.service.handle_webhook(&webhook(order.id(), 9001, false, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Declined);
    let stored = reload(&h, order.id()).await;
    assert_eq!(stored.status(), OrderStatus::PaymentFailed);
    assert_eq!(stored.gateway().unwrap().payment_status, GatewayPaymentStatus::Failed);
    assert_eq!(h.stock().await, 5);

    let outcome = h.service.handle_webhook(&webhook(order.id(), 9002, true, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Confirmed);
    let stored = reload(&h, order.id()).await;
    assert_eq!(stored.status(), OrderStatus::Confirmed);
    assert_eq!(h.stock().await, 3);

    // a stale decline arriving afterwards changes nothing
    let outcome = h.service.handle_webhook(&webhook(order.id(), 9001, false, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::AlreadyPaid);
    assert!(reload(&h, order.id()).await.is_paid());
}

#[tokio::test]
async fn test_verified_redirect_confirms_and_returns_stored_url() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    let target = h.service.handle_redirect(&redirect_query(order.id(), 77, true, 2200)).await;
    assert_eq!(target, order.gateway().unwrap().return_url.clone().unwrap());

    let stored = reload(&h, order.id()).await;
    assert!(stored.is_paid());
    assert_eq!(h.stock().await, 3);
    assert_eq!(h.store.delivery_count().await, 1);
}

#[tokio::test]
async fn test_unverified_redirect_falls_back_to_gateway_poll() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    h.gateway.settle("77", order.id(), true, 2200);

    let mut query = redirect_query(order.id(), 77, true, 2200);
    query.insert("hmac".into(), "00ff".into());
    let target = h.service.handle_redirect(&query).await;

    assert_eq!(target, format!("sehaty://payment-complete/{}", order.id()));
    assert!(reload(&h, order.id()).await.is_paid());
    assert_eq!(h.stock().await, 3);
    assert_eq!(h.gateway.polls.lock().unwrap().as_slice(), ["77"]);
}

#[tokio::test]
async fn test_malformed_redirect_transaction_id_is_never_polled() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let hostile = "12/../orders?x=1";
    h.gateway.settle(hostile, order.id(), true, 2200);

    let mut query = redirect_query(order.id(), 12, true, 2200);
    query.insert("id".into(), hostile.into());
    query.remove("hmac");
    let target = h.service.handle_redirect(&query).await;

    assert_eq!(target, format!("sehaty://payment-complete/{}", order.id()));
    assert!(h.gateway.polls.lock().unwrap().is_empty());
    assert!(!reload(&h, order.id()).await.is_paid());
    assert_eq!(h.stock().await, 5);
}

#[tokio::test]
async fn test_forged_redirect_without_gateway_record_changes_nothing() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    let mut query = redirect_query(order.id(), 78, true, 2200);
    query.remove("hmac");
    let target = h.service.handle_redirect(&query).await;

    assert_eq!(target, format!("sehaty://payment-complete/{}", order.id()));
    let stored = reload(&h, order.id()).await;
    assert!(!stored.is_paid());
    assert_eq!(stored.status(), OrderStatus::PaymentPending);
    assert_eq!(h.stock().await, 5);
}

#[tokio::test]
async fn test_redirect_with_garbage_order_id_still_redirects() {
    let h = harness(5).await;
    let mut query = redirect_query(Uuid::now_v7(), 79, true, 2200);
    query.insert("merchant_order_id".into(), "not-an-order".into());
    let target = h.service.handle_redirect(&query).await;
    assert_eq!(target, "sehaty://payment-complete/not-an-order");
}

#[tokio::test]
async fn test_verify_payment_polls_recorded_transaction() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    let outcome = h.service.handle_webhook(&webhook(order.id(), 4242, false, true, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Pending);
    let view = h.service.verify_payment(&h.customer, order.id()).await.unwrap_err();
    assert!(matches!(view, OrderError::Gateway(_)));

    h.gateway.settle("4242", order.id(), true, 2200);
    let view = h.service.verify_payment(&h.customer, order.id()).await.unwrap();
    assert!(view.is_paid);
    assert_eq!(view.status, OrderStatus::Confirmed);
    assert_eq!(view.payment_status, Some(GatewayPaymentStatus::Paid));
    assert_eq!(h.stock().await, 3);

    let stranger = Principal::user(Uuid::now_v7());
    let err = h.service.verify_payment(&stranger, order.id()).await.unwrap_err();
    assert!(matches!(err, OrderError::NotAuthorized));
}

#[tokio::test]
async fn test_payment_after_cancel_queues_refund() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    h.service.cancel(&h.customer, order.id(), Some("changed my mind".into()), false).await.unwrap();

    let outcome = h.service.handle_webhook(&webhook(order.id(), 9001, true, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::PaidAfterCancel);

    let stored = reload(&h, order.id()).await;
    assert_eq!(stored.status(), OrderStatus::Cancelled);
    assert!(stored.is_paid());
    assert!(!stored.stock_committed());
    assert_eq!(stored.refund_status(), Some(RefundStatus::Pending));
    assert_eq!(stored.refund_amount(), Some(stored.total()));
    assert_eq!(h.stock().await, 5);
    assert!(h.store.find_by_order(order.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_register_webhook_is_admin_only() {
    let h = harness(5).await;
    let err = h.service.register_webhook(&h.customer).await.unwrap_err();
    assert!(matches!(err, OrderError::NotAuthorized));
    assert!(h.gateway.webhooks.lock().unwrap().is_empty());

    let data = h.service.register_webhook(&Principal::admin(Uuid::now_v7())).await.unwrap();
    assert_eq!(data["url"], "https://api.test/api/payments/paymob/callback");
    assert_eq!(h.gateway.webhooks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_redirect_then_webhook_converge() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    h.service.handle_redirect(&redirect_query(order.id(), 77, true, 2200)).await;
    let outcome = h.service.handle_webhook(&webhook(order.id(), 77, true, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::AlreadyPaid);

    let stored = reload(&h, order.id()).await;
    assert_eq!(stored.status(), OrderStatus::Confirmed);
    assert_eq!(stored.gateway().unwrap().transaction_id.as_deref(), Some("77"));
    assert_eq!(h.stock().await, 3);
    assert_eq!(h.store.delivery_count().await, 1);
    assert_eq!(h.cart_len().await, 0);
}

#[tokio::test]
async fn test_webhook_then_redirect_converge() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;

    let outcome = h.service.handle_webhook(&webhook(order.id(), 77, true, false, 2200), None).await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Confirmed);
    let target = h.service.handle_redirect(&redirect_query(order.id(), 77, true, 2200)).await;
    assert_eq!(target, order.gateway().unwrap().return_url.clone().unwrap());

    let stored = reload(&h, order.id()).await;
    assert_eq!(stored.status(), OrderStatus::Confirmed);
    assert!(stored.stock_committed());
    assert_eq!(h.stock().await, 3);
    assert_eq!(h.store.delivery_count().await, 1);
}

#[tokio::test]
async fn test_redirect_and_webhook_together_commit_once() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let query = redirect_query(order.id(), 77, true, 2200);
    let body = webhook(order.id(), 77, true, false, 2200);

    let (_, outcome) = tokio::join!(h.service.handle_redirect(&query), h.service.handle_webhook(&body, None));
    assert!(matches!(outcome, Ok(CallbackOutcome::Confirmed | CallbackOutcome::AlreadyPaid)));

    assert!(reload(&h, order.id()).await.is_paid());
    assert_eq!(h.stock().await, 3);
    assert_eq!(h.store.delivery_count().await, 1);
}

#[tokio::test]
async fn test_webhook_rejects_redirect_scheme_signature() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let mut body = webhook(order.id(), 9001, true, false, 2200);
    let obj: Map<String, Value> = body["obj"].as_object().unwrap().clone();
    body["obj"]["hmac"] = json!(SignatureVerifier::new(SECRET).sign_redirect(&obj));

    let err = h.service.handle_webhook(&body, None).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidSignature));
    assert!(!reload(&h, order.id()).await.is_paid());
    assert_eq!(h.stock().await, 5);
}

#[tokio::test]
async fn test_redirect_with_webhook_scheme_signature_is_unverified() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let mut query = redirect_query(order.id(), 80, true, 2200);
    query.remove("hmac");
    let fields: Map<String, Value> = query.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
    query.insert("hmac".into(), SignatureVerifier::new(SECRET).sign_callback(&fields, FieldScope::ServerWebhook));

    let target = h.service.handle_redirect(&query).await;
    assert_eq!(target, format!("sehaty://payment-complete/{}", order.id()));
    // treated as unsigned: the gateway is asked and knows nothing of it
    assert_eq!(h.gateway.polls.lock().unwrap().as_slice(), ["80"]);
    assert!(!reload(&h, order.id()).await.is_paid());
    assert_eq!(h.stock().await, 5);
}

#[tokio::test]
async fn test_cancel_after_interrupted_confirmation_restores_stock() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let flaky = FlakyStore::over(&h.store);
    let service = service_over(flaky.clone(), h.gateway.clone());
    let body = webhook(order.id(), 9001, true, false, 2200);

    flaky.fail_committed_save.store(true, Ordering::SeqCst);
    let err = service.handle_webhook(&body, None).await.unwrap_err();
    assert!(matches!(err, OrderError::Storage(_)));
    let stored = reload(&h, order.id()).await;
    assert!(stored.is_paid());
    assert!(!stored.stock_committed());
    assert_eq!(h.stock().await, 3);

    let cancelled = service.cancel(&h.customer, order.id(), None, false).await.unwrap();
    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert_eq!(cancelled.refund_status(), Some(RefundStatus::Pending));
    assert_eq!(h.stock().await, 5);

    assert_eq!(service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::AlreadyPaid);
    assert_eq!(h.stock().await, 5);
    assert_eq!(h.store.delivery_count().await, 0);
}

#[tokio::test]
async fn test_failed_cart_clear_is_finished_by_replay() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let flaky = FlakyStore::over(&h.store);
    let service = service_over(flaky.clone(), h.gateway.clone());
    let body = webhook(order.id(), 9001, true, false, 2200);

    flaky.fail_cart_clear.store(true, Ordering::SeqCst);
    assert!(service.handle_webhook(&body, None).await.is_err());
    assert_eq!(h.store.delivery_count().await, 1);
    assert_eq!(h.cart_len().await, 1);
    assert!(!reload(&h, order.id()).await.cart_cleared());

    assert_eq!(service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::AlreadyPaid);
    assert_eq!(h.cart_len().await, 0);
    assert!(reload(&h, order.id()).await.cart_cleared());
    assert_eq!(h.stock().await, 3);
    assert_eq!(h.store.delivery_count().await, 1);
}

#[tokio::test]
async fn test_replay_keeps_a_cart_filled_after_payment() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let body = webhook(order.id(), 9001, true, false, 2200);

    assert_eq!(h.service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::Confirmed);
    assert_eq!(h.cart_len().await, 0);

    h.fill_cart().await;
    assert_eq!(h.service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::AlreadyPaid);
    assert_eq!(h.cart_len().await, 1);
}

#[tokio::test]
async fn test_repeated_pending_notice_leaves_order_unwritten() {
    let h = harness(5).await;
    let order = gateway_order(&h, 2).await;
    let body = webhook(order.id(), 4242, false, true, 2200);

    assert_eq!(h.service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::Pending);
    let first = reload(&h, order.id()).await;
    assert_eq!(first.gateway().unwrap().transaction_id.as_deref(), Some("4242"));

    assert_eq!(h.service.handle_webhook(&body, None).await.unwrap(), CallbackOutcome::Pending);
    let second = reload(&h, order.id()).await;
    assert_eq!(second.version(), first.version());
    assert_eq!(second.updated_at(), first.updated_at());
}
