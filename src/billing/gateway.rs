use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::error::BillingResult;
use super::models::SubscriptionStatus;

/// key: billing-gateway -> every call to the external processor goes through here
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Provider tag recorded on transactions and matched against the webhook route.
    fn provider(&self) -> &str;

    async fn create_or_reuse_customer(
        &self,
        email: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<String>;

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    async fn create_one_time_charge(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        amount_minor: i64,
        currency: &str,
    ) -> BillingResult<ChargeOutcome>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<SubscriptionOutcome>;

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot>;

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot>;

    /// Verifies the signature over the raw, unparsed body and only then decodes it.
    fn verify_and_decode_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> BillingResult<BillingEvent>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOutcome {
    pub external_payment_id: String,
    pub status: String,
    pub client_secret: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
}

impl ChargeOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOutcome {
    pub external_subscription_id: String,
    pub status: String,
    pub latest_invoice_id: Option<String>,
    pub client_secret: Option<String>,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
}

/// Synchronous view of a subscription returned by the processor after a mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    pub external_subscription_id: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceSnapshot {
    pub price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub interval: String,
}

/// A verified processor event. The payload has already been narrowed to the variant the
/// reconciliation engine needs.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub kind: BillingEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    RecurringPaymentSucceeded(InvoiceEvent),
    RecurringPaymentFailed(InvoiceEvent),
    SubscriptionCanceled(SubscriptionEvent),
    SubscriptionUpdated(SubscriptionEvent),
    OneTimePaymentSucceeded(PaymentIntentEvent),
    OneTimePaymentFailed(PaymentIntentEvent),
    Unrecognized { kind: String },
}

impl BillingEventKind {
    pub fn label(&self) -> &str {
        match self {
            Self::RecurringPaymentSucceeded(_) => "recurring_payment_succeeded",
            Self::RecurringPaymentFailed(_) => "recurring_payment_failed",
            Self::SubscriptionCanceled(_) => "subscription_canceled",
            Self::SubscriptionUpdated(_) => "subscription_updated",
            Self::OneTimePaymentSucceeded(_) => "one_time_payment_succeeded",
            Self::OneTimePaymentFailed(_) => "one_time_payment_failed",
            Self::Unrecognized { kind } => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceEvent {
    pub invoice_id: String,
    pub subscription_id: String,
    pub customer_id: String,
    pub amount_paid_minor: i64,
    pub amount_due_minor: i64,
    pub currency: String,
    pub status: String,
    pub billing_reason: Option<String>,
    pub price_id: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

impl InvoiceEvent {
    /// The first invoice shares the subscription id with the transaction written at
    /// subscribe time; later invoices get their own row keyed by invoice id.
    pub fn transaction_reference(&self) -> &str {
        match self.billing_reason.as_deref() {
            None | Some("subscription_create") => &self.subscription_id,
            Some(_) => &self.invoice_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub subscription_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub raw_status: String,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntentEvent {
    pub payment_intent_id: String,
    pub amount_minor: i64,
    pub amount_received_minor: i64,
    pub currency: String,
    pub status: String,
}
