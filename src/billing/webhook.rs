//! Webhook signature verification and event decoding for the processor.
//!
//! The signature header has the form `t=<unix>,v1=<hex>[,v1=<hex>...]`. The MAC is
//! HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint signing secret, so it is
//! always computed on the bytes exactly as delivered, before any JSON parsing.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::debug;

use super::error::{BillingError, BillingResult};
use super::gateway::{
    BillingEvent, BillingEventKind, InvoiceEvent, PaymentIntentEvent, SubscriptionEvent,
};
use super::models::SubscriptionStatus;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    fn parse(raw: &str) -> BillingResult<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in raw.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| {
                        BillingError::SignatureInvalid("timestamp is not an integer".into())
                    })?);
                }
                "v1" => {
                    // Malformed entries are skipped; another v1 may still match.
                    if let Ok(bytes) = hex::decode(value) {
                        signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }
        let timestamp = timestamp
            .ok_or_else(|| BillingError::SignatureInvalid("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(BillingError::SignatureInvalid("missing v1 signature".into()));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// key: billing-webhook-signature -> HMAC over raw bytes, constant-time compare
pub fn verify_signature(
    raw_body: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> BillingResult<()> {
    let header = SignatureHeader::parse(signature_header)?;

    let skew = now.timestamp().abs_diff(header.timestamp);
    if skew > tolerance_secs.unsigned_abs() {
        return Err(BillingError::SignatureInvalid(format!(
            "timestamp outside tolerance ({skew}s)"
        )));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid("unusable signing secret".into()))?;
    mac.update(header.timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);

    let matched = header
        .signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok());
    if !matched {
        return Err(BillingError::SignatureInvalid(
            "no signature matched the payload".into(),
        ));
    }
    Ok(())
}

/// Builds a header value for `raw_body`. Used by tests and local replay tooling.
pub fn sign_payload(raw_body: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    parent: Option<InvoiceParent>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    currency: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default)]
    lines: Option<InvoiceLines>,
}

#[derive(Debug, Deserialize)]
struct InvoiceParent {
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    #[serde(default)]
    subscription: Option<Expandable>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLine {
    #[serde(default)]
    price: Option<Expandable>,
    #[serde(default)]
    pricing: Option<LinePricing>,
    #[serde(default)]
    period: Option<LinePeriod>,
}

#[derive(Debug, Deserialize)]
struct LinePricing {
    #[serde(default)]
    price_details: Option<PriceDetails>,
}

#[derive(Debug, Deserialize)]
struct PriceDetails {
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinePeriod {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Expandable,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    canceled_at: Option<i64>,
    #[serde(default)]
    items: Option<SubscriptionItems>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    amount: i64,
    #[serde(default)]
    amount_received: i64,
    currency: String,
    status: String,
}

pub(crate) fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn object<T: serde::de::DeserializeOwned>(event_type: &str, value: Value) -> BillingResult<T> {
    serde_json::from_value(value).map_err(|err| {
        BillingError::Validation(format!("malformed `{event_type}` payload: {err}"))
    })
}

/// Decodes an already verified payload into the closed event union.
pub fn decode_event(raw_body: &[u8]) -> BillingResult<BillingEvent> {
    let envelope: EventEnvelope = serde_json::from_slice(raw_body)
        .map_err(|err| BillingError::Validation(format!("malformed event envelope: {err}")))?;
    let created_at = timestamp(envelope.created)
        .ok_or_else(|| BillingError::Validation("event timestamp out of range".into()))?;
    let event_type = envelope.event_type.as_str();

    let kind = match event_type {
        "invoice.paid" | "invoice.payment_succeeded" => {
            match invoice_event(object(event_type, envelope.data.object)?) {
                Some(invoice) => BillingEventKind::RecurringPaymentSucceeded(invoice),
                None => unrecognized(event_type, "invoice has no subscription"),
            }
        }
        "invoice.payment_failed" => {
            match invoice_event(object(event_type, envelope.data.object)?) {
                Some(invoice) => BillingEventKind::RecurringPaymentFailed(invoice),
                None => unrecognized(event_type, "invoice has no subscription"),
            }
        }
        "customer.subscription.deleted" => BillingEventKind::SubscriptionCanceled(
            subscription_event(object(event_type, envelope.data.object)?),
        ),
        "customer.subscription.updated" => BillingEventKind::SubscriptionUpdated(
            subscription_event(object(event_type, envelope.data.object)?),
        ),
        "payment_intent.succeeded" => BillingEventKind::OneTimePaymentSucceeded(
            payment_intent_event(object(event_type, envelope.data.object)?),
        ),
        "payment_intent.payment_failed" => BillingEventKind::OneTimePaymentFailed(
            payment_intent_event(object(event_type, envelope.data.object)?),
        ),
        other => BillingEventKind::Unrecognized {
            kind: other.to_string(),
        },
    };

    Ok(BillingEvent {
        id: envelope.id,
        created_at,
        kind,
    })
}

fn unrecognized(event_type: &str, reason: &str) -> BillingEventKind {
    debug!(event_type, reason, "treating processor event as unrecognized");
    BillingEventKind::Unrecognized {
        kind: event_type.to_string(),
    }
}

fn invoice_event(invoice: InvoiceObject) -> Option<InvoiceEvent> {
    let mut details = invoice
        .parent
        .and_then(|parent| parent.subscription_details)
        .or(invoice.subscription_details);
    let subscription_id = invoice
        .subscription
        .map(Expandable::into_id)
        .or_else(|| {
            details
                .as_mut()
                .and_then(|details| details.subscription.take())
                .map(Expandable::into_id)
        })?;
    let user_id = details
        .as_ref()
        .and_then(|details| details.metadata.get("user_id").cloned());

    let first_line = invoice.lines.and_then(|lines| lines.data.into_iter().next());
    let (price_id, period) = match first_line {
        Some(line) => {
            let price_id = line.price.map(Expandable::into_id).or_else(|| {
                line.pricing
                    .and_then(|pricing| pricing.price_details)
                    .and_then(|details| details.price)
            });
            (price_id, line.period)
        }
        None => (None, None),
    };

    Some(InvoiceEvent {
        invoice_id: invoice.id,
        subscription_id,
        customer_id: invoice
            .customer
            .map(Expandable::into_id)
            .unwrap_or_default(),
        amount_paid_minor: invoice.amount_paid,
        amount_due_minor: invoice.amount_due,
        currency: invoice.currency.to_ascii_lowercase(),
        status: invoice.status.unwrap_or_default(),
        billing_reason: invoice.billing_reason,
        price_id,
        period_start: period.as_ref().and_then(|p| timestamp(p.start)),
        period_end: period.as_ref().and_then(|p| timestamp(p.end)),
        user_id,
    })
}

fn subscription_event(mut subscription: SubscriptionObject) -> SubscriptionEvent {
    let user_id = subscription.metadata.remove("user_id");
    let first_item = subscription
        .items
        .and_then(|items| items.data.into_iter().next());
    let period_start = subscription
        .current_period_start
        .or_else(|| first_item.as_ref().and_then(|item| item.current_period_start));
    let period_end = subscription
        .current_period_end
        .or_else(|| first_item.as_ref().and_then(|item| item.current_period_end));

    SubscriptionEvent {
        subscription_id: subscription.id,
        customer_id: subscription.customer.into_id(),
        status: SubscriptionStatus::from_processor(&subscription.status),
        raw_status: subscription.status,
        cancel_at_period_end: subscription.cancel_at_period_end,
        current_period_start: period_start.and_then(timestamp),
        current_period_end: period_end.and_then(timestamp),
        canceled_at: subscription.canceled_at.and_then(timestamp),
        user_id,
    }
}

fn payment_intent_event(intent: PaymentIntentObject) -> PaymentIntentEvent {
    PaymentIntentEvent {
        payment_intent_id: intent.id,
        amount_minor: intent.amount,
        amount_received_minor: intent.amount_received,
        currency: intent.currency.to_ascii_lowercase(),
        status: intent.status,
    }
}
