#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use booking_backend::billing::gateway::{
    BillingEvent, BillingEventKind, BillingGateway, ChargeOutcome, InvoiceEvent,
    PaymentIntentEvent, PriceSnapshot, SubscriptionEvent, SubscriptionOutcome,
    SubscriptionSnapshot,
};
use booking_backend::billing::models::{
    NewSubscription, NewTransaction, PaymentTransaction, Subscription, SubscriptionGuard,
    SubscriptionStatus, SubscriptionUpdate, TransactionType,
};
use booking_backend::billing::store::{BillingStore, MemoryBillingStore};
use booking_backend::billing::webhook::{decode_event, verify_signature};
use booking_backend::billing::{BillingError, BillingResult, BillingService};
use booking_backend::notifications::{NotificationDispatcher, NotificationOutcome};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

pub const WEBHOOK_SECRET: &str = "whsec_test";
pub const PRICE_ID: &str = "price_monthly";

/// In-process stand-in for the processor. Records every call it receives.
pub struct FakeGateway {
    pub calls: Mutex<Vec<String>>,
    pub charges: Mutex<Vec<(i64, String)>>,
    pub subscription_status: String,
    pub existing_customer: Option<String>,
    /// Status written to the store while a cancel request is in flight.
    pub status_during_cancel: Mutex<Option<(Arc<MemoryBillingStore>, SubscriptionStatus)>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            charges: Mutex::new(Vec::new()),
            subscription_status: "incomplete".to_string(),
            existing_customer: None,
            status_during_cancel: Mutex::new(None),
        }
    }
}

impl FakeGateway {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl BillingGateway for FakeGateway {
    fn provider(&self) -> &str {
        "stripe"
    }

    async fn create_or_reuse_customer(
        &self,
        email: &str,
        _metadata: &HashMap<String, String>,
    ) -> BillingResult<String> {
        self.record(format!("customer:{email}"));
        Ok(self
            .existing_customer
            .clone()
            .unwrap_or_else(|| "cus_1".to_string()))
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        self.record(format!("attach:{customer_id}:{payment_method_id}"));
        if payment_method_id == "pm_declined" {
            return Err(BillingError::ExternalService("card declined".into()));
        }
        Ok(())
    }

    async fn create_one_time_charge(
        &self,
        customer_id: &str,
        _payment_method_id: &str,
        amount_minor: i64,
        currency: &str,
    ) -> BillingResult<ChargeOutcome> {
        self.record(format!("charge:{customer_id}"));
        self.charges
            .lock()
            .unwrap()
            .push((amount_minor, currency.to_string()));
        Ok(ChargeOutcome {
            external_payment_id: "pi_1".into(),
            status: "succeeded".into(),
            client_secret: Some("pi_1_secret".into()),
            amount_minor,
            currency: currency.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        _metadata: &HashMap<String, String>,
    ) -> BillingResult<SubscriptionOutcome> {
        self.record(format!("subscribe:{customer_id}:{price_id}"));
        Ok(SubscriptionOutcome {
            external_subscription_id: "sub_1".into(),
            status: self.subscription_status.clone(),
            latest_invoice_id: Some("in_1".into()),
            client_secret: Some("seti_secret".into()),
            cancel_at_period_end: false,
            current_period_start: Some(Utc::now()),
            current_period_end: Some(Utc::now() + Duration::days(30)),
            amount_minor: Some(1999),
            currency: Some("usd".into()),
        })
    }

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.record(format!("cancel:{external_subscription_id}:{cancel_at_period_end}"));
        let concurrent = self.status_during_cancel.lock().unwrap().take();
        if let Some((store, status)) = concurrent {
            store
                .update_subscription_status(
                    external_subscription_id,
                    SubscriptionUpdate::status(status, status == SubscriptionStatus::Active),
                    SubscriptionGuard::from_statuses(&SubscriptionStatus::LIVE),
                )
                .await
                .unwrap();
        }
        Ok(SubscriptionSnapshot {
            external_subscription_id: external_subscription_id.to_string(),
            status: if cancel_at_period_end {
                "active".into()
            } else {
                "canceled".into()
            },
            cancel_at_period_end,
            current_period_end: Some(Utc::now() + Duration::days(20)),
            canceled_at: (!cancel_at_period_end).then(Utc::now),
        })
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot> {
        self.record(format!("price:{price_id}"));
        Ok(PriceSnapshot {
            price_id: price_id.to_string(),
            amount_minor: 1999,
            currency: "usd".into(),
            interval: "month".into(),
        })
    }

    fn verify_and_decode_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> BillingResult<BillingEvent> {
        verify_signature(raw_body, signature_header, WEBHOOK_SECRET, 300, Utc::now())?;
        decode_event(raw_body)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn send_notification(&self, title: &str, _body: &str, data: Value) -> NotificationOutcome {
        self.sent.lock().unwrap().push((title.to_string(), data));
        NotificationOutcome {
            success: true,
            success_count: 1,
            failure_count: 0,
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryBillingStore>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: BillingService,
}

pub fn harness() -> Harness {
    harness_with(FakeGateway::default())
}

pub fn harness_with(gateway: FakeGateway) -> Harness {
    let store = Arc::new(MemoryBillingStore::new());
    let gateway = Arc::new(gateway);
    let notifier = Arc::new(RecordingNotifier::default());
    let service = BillingService::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        PRICE_ID,
    );
    Harness {
        store,
        gateway,
        notifier,
        service,
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub async fn seed_subscription(
    store: &MemoryBillingStore,
    subscription_id: &str,
    user_id: &str,
    status: SubscriptionStatus,
) -> Subscription {
    store
        .create_subscription(NewSubscription {
            user_id: user_id.to_string(),
            external_customer_id: "cus_1".into(),
            external_subscription_id: subscription_id.to_string(),
            plan_id: None,
            status,
            current_period_start: Some(Utc::now()),
            current_period_end: Some(Utc::now() + Duration::days(30)),
            cancel_at_period_end: false,
        })
        .await
        .unwrap()
}

pub async fn seed_pending(
    store: &MemoryBillingStore,
    reference: &str,
    transaction_type: TransactionType,
) -> PaymentTransaction {
    store
        .create_transaction(NewTransaction {
            user_id: "u1".into(),
            transaction_type,
            provider: "stripe".into(),
            reference_number: reference.to_string(),
            amount_minor: 1999,
            currency: "usd".into(),
            provider_status: None,
        })
        .await
        .unwrap()
}

pub fn invoice(subscription_id: &str, user_id: Option<&str>) -> InvoiceEvent {
    InvoiceEvent {
        invoice_id: "in_1".into(),
        subscription_id: subscription_id.to_string(),
        customer_id: "cus_1".into(),
        amount_paid_minor: 1999,
        amount_due_minor: 1999,
        currency: "usd".into(),
        status: "paid".into(),
        billing_reason: Some("subscription_create".into()),
        price_id: Some(PRICE_ID.into()),
        period_start: Some(Utc::now()),
        period_end: Some(Utc::now() + Duration::days(30)),
        user_id: user_id.map(str::to_string),
    }
}

pub fn subscription_event(subscription_id: &str, status: &str) -> SubscriptionEvent {
    SubscriptionEvent {
        subscription_id: subscription_id.to_string(),
        customer_id: "cus_1".into(),
        status: SubscriptionStatus::from_processor(status),
        raw_status: status.to_string(),
        cancel_at_period_end: false,
        current_period_start: Some(Utc::now()),
        current_period_end: Some(Utc::now() + Duration::days(30)),
        canceled_at: None,
        user_id: None,
    }
}

pub fn payment_intent(payment_intent_id: &str, status: &str, received: i64) -> PaymentIntentEvent {
    PaymentIntentEvent {
        payment_intent_id: payment_intent_id.to_string(),
        amount_minor: 1999,
        amount_received_minor: received,
        currency: "usd".into(),
        status: status.to_string(),
    }
}

pub fn event(id: &str, created_at: DateTime<Utc>, kind: BillingEventKind) -> BillingEvent {
    BillingEvent {
        id: id.to_string(),
        created_at,
        kind,
    }
}
