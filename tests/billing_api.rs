mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Extension, Router};
use booking_backend::billing::models::{SubscriptionStatus, TransactionStatus, TransactionType};
use booking_backend::billing::store::BillingStore;
use booking_backend::billing::webhook::sign_payload;
use booking_backend::billing::BillingService;
use booking_backend::routes::api_routes;
use chrono::Utc;
use common::*;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

const JWT_SECRET: &str = "billing-api-secret";

fn app(service: BillingService) -> Router {
    std::env::set_var("JWT_SECRET", JWT_SECRET);
    Router::new()
        .merge(api_routes())
        .layer(Extension(service))
}

fn bearer(user_id: &str) -> String {
    let claims = json!({"sub": user_id, "role": "customer", "exp": 9999999999u64});
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {token}")
}

fn paid_invoice_payload(event_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "invoice.paid",
        "created": Utc::now().timestamp(),
        "data": {"object": {
            "id": "in_1",
            "customer": "cus_1",
            "subscription": "sub_1",
            "amount_paid": 1999,
            "amount_due": 1999,
            "currency": "usd",
            "status": "paid",
            "billing_reason": "subscription_create"
        }}
    })
    .to_string()
    .into_bytes()
}

fn webhook_request(body: Vec<u8>, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/payment/stripe/webhook")
        .header("stripe-signature", signature)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn json_request(uri: &str, auth: Option<String>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("Authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn invalid_signature_is_rejected_without_writes() {
    let h = harness();
    let body = paid_invoice_payload("evt_forged");
    let forged = format!("t={},v1={}", Utc::now().timestamp(), "ab".repeat(32));

    let response = app(h.service.clone())
        .oneshot(webhook_request(body, &forged))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.store.write_count(), 0);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid signature");
}

#[tokio::test]
async fn missing_signature_header_is_rejected() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/payment/stripe/webhook")
        .body(Body::from(paid_invoice_payload("evt_1")))
        .unwrap();

    let response = app(h.service.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let h = harness();
    let body = paid_invoice_payload("evt_1");
    let signature = sign_payload(&body, WEBHOOK_SECRET, Utc::now().timestamp());
    let request = Request::builder()
        .method("POST")
        .uri("/payment/paypal/webhook")
        .header("paypal-signature", signature)
        .body(Body::from(body))
        .unwrap();

    let response = app(h.service.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn signed_event_is_acknowledged_once_and_replays_are_harmless() {
    let h = harness();
    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Incomplete).await;
    seed_pending(&h.store, "sub_1", TransactionType::Subscription).await;
    let body = paid_invoice_payload("evt_paid");
    let signature = sign_payload(&body, WEBHOOK_SECRET, Utc::now().timestamp());

    let response = app(h.service.clone())
        .oneshot(webhook_request(body.clone(), &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"received": true}));
    let writes = h.store.write_count();

    let replay = app(h.service.clone())
        .oneshot(webhook_request(body, &signature))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(h.store.write_count(), writes);

    let transaction = h.store.transaction_by_reference("sub_1").unwrap();
    assert_eq!(transaction.status, TransactionStatus::Completed);
    let subscription = h
        .store
        .find_subscription_by_external_id("sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn subscribe_creates_one_subscription_and_one_pending_transaction() {
    let h = harness();

    let response = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/subscribe",
            None,
            json!({"email": "a@b.com", "paymentMethodId": "pm_1", "userId": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["customerId"], "cus_1");
    assert_eq!(body["subscriptionId"], "sub_1");
    assert_eq!(body["status"], "incomplete");
    assert_eq!(body["clientSecret"], "seti_secret");

    let customer_calls = h
        .gateway
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("customer:"))
        .count();
    assert_eq!(customer_calls, 1);

    let subscriptions = h.store.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].user_id, "u1");
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Incomplete);
    assert!(subscriptions[0].plan_id.is_some());

    let transactions = h.store.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Pending);
    assert_eq!(transactions[0].reference_number, "sub_1");
    assert_eq!(transactions[0].amount_minor, 1999);
}

#[tokio::test]
async fn subscribe_rejects_incomplete_payload() {
    let h = harness();

    let response = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/subscribe",
            None,
            json!({"email": "a@b.com", "userId": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["success"], false);
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn processor_failure_leaves_no_local_rows() {
    let h = harness();

    let response = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/subscribe",
            None,
            json!({"email": "a@b.com", "paymentMethodId": "pm_declined", "userId": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(h.store.subscriptions().is_empty());
    assert!(h.store.transactions().is_empty());
}

#[tokio::test]
async fn cancel_at_period_end_keeps_access_until_period_end() {
    let h = harness();
    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Active).await;

    let response = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/cancel-subscription",
            Some(bearer("u1")),
            json!({"subscriptionId": "sub_1", "cancelAtPeriodEnd": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["cancelAtPeriodEnd"], true);
    assert_eq!(body["data"]["status"], "active");

    let subscription = h
        .store
        .find_subscription_by_external_id("sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert!(subscription.cancel_at_period_end);
    assert!(subscription.is_active);
    assert!(subscription.is_entitled(Utc::now()));
}

#[tokio::test]
async fn immediate_cancel_marks_subscription_canceled() {
    let h = harness();
    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Active).await;

    let response = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/cancel-subscription",
            Some(bearer("u1")),
            json!({"subscriptionId": "sub_1", "cancelAtPeriodEnd": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let subscription = h
        .store
        .find_subscription_by_external_id("sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Canceled);
    assert!(!subscription.is_active);
    assert!(subscription.canceled_at.is_some());
}

#[tokio::test]
async fn cancel_requires_the_owner() {
    let h = harness();
    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Active).await;

    let foreign = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/cancel-subscription",
            Some(bearer("u2")),
            json!({"subscriptionId": "sub_1", "cancelAtPeriodEnd": true}),
        ))
        .await
        .unwrap();
    assert_eq!(foreign.status(), StatusCode::FORBIDDEN);

    let anonymous = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/cancel-subscription",
            None,
            json!({"subscriptionId": "sub_1", "cancelAtPeriodEnd": true}),
        ))
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let missing = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/cancel-subscription",
            Some(bearer("u1")),
            json!({"subscriptionId": "sub_404", "cancelAtPeriodEnd": true}),
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert!(!h.gateway.calls().iter().any(|call| call.starts_with("cancel:")));
}

#[tokio::test]
async fn instant_payment_returns_intent_and_defaults_currency() {
    let h = harness();

    let response = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/instant-payment",
            Some(bearer("u1")),
            json!({"email": "a@b.com", "paymentMethodId": "pm_1", "amount": 19.99}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["paymentIntentId"], "pi_1");
    assert_eq!(body["data"]["clientSecret"], "pi_1_secret");
    assert_eq!(
        h.gateway.charges.lock().unwrap().clone(),
        vec![(1999, "usd".to_string())]
    );

    let rejected = app(h.service.clone())
        .oneshot(json_request(
            "/payment/stripe/instant-payment",
            Some(bearer("u1")),
            json!({"email": "a@b.com", "paymentMethodId": "pm_1", "amount": -5}),
        ))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn current_subscription_reflects_entitlement() {
    let h = harness();

    let none = app(h.service.clone())
        .oneshot(
            Request::builder()
                .uri("/payment/stripe/subscription")
                .header("Authorization", bearer("u1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(none.status(), StatusCode::NOT_FOUND);

    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Active).await;
    let some = app(h.service.clone())
        .oneshot(
            Request::builder()
                .uri("/payment/stripe/subscription")
                .header("Authorization", bearer("u1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(some.status(), StatusCode::OK);
    let body = body_json(some).await;
    assert_eq!(body["data"]["external_subscription_id"], "sub_1");
    assert_eq!(body["data"]["status"], "active");
}
