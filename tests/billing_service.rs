mod common;

use booking_backend::billing::gateway::BillingEventKind;
use booking_backend::billing::models::{SubscriptionStatus, TransactionStatus, TransactionType};
use booking_backend::billing::store::BillingStore;
use booking_backend::billing::Checkout;
use common::*;

// key: billing-service-tests -> user flows racing processor webhooks

#[tokio::test]
async fn period_end_cancel_keeps_a_status_written_while_the_processor_call_ran() {
    let h = harness();
    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Active).await;
    *h.gateway.status_during_cancel.lock().unwrap() =
        Some((h.store.clone(), SubscriptionStatus::PastDue));

    let snapshot = h
        .service
        .cancel_subscription("u1", "sub_1", true)
        .await
        .unwrap();
    assert!(snapshot.cancel_at_period_end);

    let subscription = h
        .store
        .find_subscription_by_external_id("sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::PastDue);
    assert!(!subscription.is_active);
}

#[tokio::test]
async fn immediate_cancel_still_lands_after_a_concurrent_status_change() {
    let h = harness();
    seed_subscription(&h.store, "sub_1", "u1", SubscriptionStatus::Active).await;
    *h.gateway.status_during_cancel.lock().unwrap() =
        Some((h.store.clone(), SubscriptionStatus::PastDue));

    h.service
        .cancel_subscription("u1", "sub_1", false)
        .await
        .unwrap();

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
async fn first_invoice_paid_before_subscribe_returns_leaves_nothing_pending() {
    let h = harness();
    h.service
        .engine()
        .apply(event(
            "evt_paid",
            at(10),
            BillingEventKind::RecurringPaymentSucceeded(invoice("sub_1", Some("u1"))),
        ))
        .await
        .unwrap();

    let receipt = h
        .service
        .subscribe(
            "u1",
            Checkout::Card {
                email: "a@b.com".into(),
                payment_method_id: "pm_1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.subscription_id, "sub_1");

    let subscriptions = h.store.subscriptions();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Active);
    assert!(subscriptions[0].is_active);

    let transactions = h.store.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].reference_number, "sub_1");
    assert_eq!(transactions[0].transaction_type, TransactionType::Subscription);
    assert_eq!(transactions[0].status, TransactionStatus::Completed);
    assert_eq!(transactions[0].paid_amount_minor, Some(1999));
}

#[tokio::test]
async fn first_invoice_paid_after_subscribe_settles_its_row() {
    let h = harness();
    h.service
        .subscribe(
            "u1",
            Checkout::Card {
                email: "a@b.com".into(),
                payment_method_id: "pm_1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        h.store.transaction_by_reference("sub_1").unwrap().status,
        TransactionStatus::Pending
    );

    h.service
        .engine()
        .apply(event(
            "evt_paid",
            at(10),
            BillingEventKind::RecurringPaymentSucceeded(invoice("sub_1", Some("u1"))),
        ))
        .await
        .unwrap();

    let transactions = h.store.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Completed);
}
