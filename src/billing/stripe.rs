use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use super::error::{BillingError, BillingResult};
use super::gateway::{
    BillingEvent, BillingGateway, ChargeOutcome, PriceSnapshot, SubscriptionOutcome,
    SubscriptionSnapshot,
};
use super::webhook::{decode_event, timestamp, verify_signature};

/// Processor credentials and endpoints. Built once at startup from the environment.
#[derive(Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    pub monthly_price_id: String,
    pub api_base: String,
    pub return_url: String,
    pub webhook_tolerance_secs: i64,
}

impl fmt::Debug for StripeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeSettings")
            .field("secret_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("monthly_price_id", &self.monthly_price_id)
            .field("api_base", &self.api_base)
            .field("return_url", &self.return_url)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish()
    }
}

/// key: billing-gateway-stripe -> REST client over the processor API
pub struct StripeGateway {
    client: reqwest::Client,
    settings: StripeSettings,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustomerList {
    data: Vec<CustomerObject>,
}

#[derive(Debug, Deserialize)]
struct CustomerObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
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
    latest_invoice: Option<LatestInvoice>,
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
    #[serde(default)]
    price: Option<PriceObject>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LatestInvoice {
    Id(String),
    Expanded(InvoiceObject),
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<ExpandedIntent>,
    #[serde(default)]
    confirmation_secret: Option<ConfirmationSecret>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpandedIntent {
    Id(String),
    Object {
        #[serde(default)]
        client_secret: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ConfirmationSecret {
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    id: String,
    #[serde(default)]
    unit_amount: Option<i64>,
    currency: String,
    #[serde(default)]
    recurring: Option<Recurring>,
}

#[derive(Debug, Deserialize)]
struct Recurring {
    interval: String,
}

impl SubscriptionObject {
    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref().and_then(|items| items.data.first())
    }

    fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.first_item().and_then(|item| item.current_period_start))
    }

    fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.first_item().and_then(|item| item.current_period_end))
    }

    fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            external_subscription_id: self.id.clone(),
            status: self.status.clone(),
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_end: self.period_end().and_then(timestamp),
            canceled_at: self.canceled_at.and_then(timestamp),
        }
    }
}

impl StripeGateway {
    pub fn new(settings: StripeSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build payment processor client")?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &StripeSettings {
        &self.settings
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.settings.api_base.trim_end_matches('/'), path)
    }

    /// Builds `v1/{collection}/{id}{suffix}`, refusing ids that would escape the segment.
    fn resource_path(&self, collection: &str, id: &str, suffix: &str) -> BillingResult<String> {
        if !is_object_id(id) {
            return Err(BillingError::Validation(format!(
                "`{id}` is not a valid {collection} id"
            )));
        }
        Ok(self.endpoint(&format!("v1/{collection}/{id}{suffix}")))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProcessorFailure> {
        let response = request
            .bearer_auth(&self.settings.secret_key)
            .send()
            .await
            .map_err(|err| {
                warn!(?err, operation, "payment processor unreachable");
                ProcessorFailure {
                    code: None,
                    message: format!("{operation}: {err}"),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<ErrorEnvelope>(&body).ok();
            let (code, message) = match parsed {
                Some(envelope) => (
                    envelope.error.code,
                    envelope.error.message.unwrap_or_else(|| status.to_string()),
                ),
                None => (None, status.to_string()),
            };
            warn!(operation, %status, code = ?code, "payment processor rejected request");
            return Err(ProcessorFailure {
                code,
                message: format!("{operation}: {message}"),
            });
        }

        response.json::<T>().await.map_err(|err| ProcessorFailure {
            code: None,
            message: format!("{operation}: undecodable response: {err}"),
        })
    }
}

#[derive(Debug)]
struct ProcessorFailure {
    code: Option<String>,
    message: String,
}

impl From<ProcessorFailure> for BillingError {
    fn from(failure: ProcessorFailure) -> Self {
        BillingError::ExternalService(failure.message)
    }
}

fn metadata_params(metadata: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = metadata
        .iter()
        .map(|(key, value)| (format!("metadata[{key}]"), value.clone()))
        .collect();
    params.sort();
    params
}

fn is_object_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl BillingGateway for StripeGateway {
    fn provider(&self) -> &str {
        "stripe"
    }

    async fn create_or_reuse_customer(
        &self,
        email: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<String> {
        let existing: CustomerList = self
            .send(
                "list customers",
                self.client
                    .get(self.endpoint("v1/customers"))
                    .query(&[("email", email), ("limit", "1")]),
            )
            .await?;
        if let Some(customer) = existing.data.into_iter().next() {
            info!(customer_id = %customer.id, "reusing existing billing customer");
            return Ok(customer.id);
        }

        let mut params = vec![("email".to_string(), email.to_string())];
        params.extend(metadata_params(metadata));
        let created: CustomerObject = self
            .send(
                "create customer",
                self.client.post(self.endpoint("v1/customers")).form(&params),
            )
            .await?;
        info!(customer_id = %created.id, "created billing customer");
        Ok(created.id)
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let attach_url = self.resource_path("payment_methods", payment_method_id, "/attach")?;
        let customer_url = self.resource_path("customers", customer_id, "")?;
        let attached = self
            .send::<serde_json::Value>(
                "attach payment method",
                self.client
                    .post(attach_url)
                    .form(&[("customer", customer_id)]),
            )
            .await;
        match attached {
            Ok(_) => {}
            Err(failure) if failure.code.as_deref() == Some("resource_already_attached") => {
                info!(%customer_id, %payment_method_id, "payment method already attached");
            }
            Err(failure) => return Err(failure.into()),
        }

        self.send::<serde_json::Value>(
            "set default payment method",
            self.client
                .post(customer_url)
                .form(&[("invoice_settings[default_payment_method]", payment_method_id)]),
        )
        .await?;
        Ok(())
    }

    async fn create_one_time_charge(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        amount_minor: i64,
        currency: &str,
    ) -> BillingResult<ChargeOutcome> {
        let amount = amount_minor.to_string();
        let params = [
            ("amount", amount.as_str()),
            ("currency", currency),
            ("customer", customer_id),
            ("payment_method", payment_method_id),
            ("confirm", "true"),
            ("automatic_payment_methods[enabled]", "true"),
            ("automatic_payment_methods[allow_redirects]", "never"),
            ("return_url", self.settings.return_url.as_str()),
        ];
        let intent: PaymentIntentObject = self
            .send(
                "create payment intent",
                self.client
                    .post(self.endpoint("v1/payment_intents"))
                    .form(&params),
            )
            .await?;
        info!(payment_intent = %intent.id, status = %intent.status, "payment intent created");
        Ok(ChargeOutcome {
            external_payment_id: intent.id,
            status: intent.status,
            client_secret: intent.client_secret,
            amount_minor: intent.amount,
            currency: intent.currency.to_ascii_lowercase(),
        })
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<SubscriptionOutcome> {
        let mut params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("expand[]".to_string(), "latest_invoice.payment_intent".to_string()),
        ];
        params.extend(metadata_params(metadata));
        let subscription: SubscriptionObject = self
            .send(
                "create subscription",
                self.client
                    .post(self.endpoint("v1/subscriptions"))
                    .form(&params),
            )
            .await?;
        info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "subscription created"
        );

        let (latest_invoice_id, client_secret) = match &subscription.latest_invoice {
            Some(LatestInvoice::Id(id)) => (Some(id.clone()), None),
            Some(LatestInvoice::Expanded(invoice)) => {
                let secret = match &invoice.payment_intent {
                    Some(ExpandedIntent::Object { client_secret }) => client_secret.clone(),
                    _ => None,
                }
                .or_else(|| {
                    invoice
                        .confirmation_secret
                        .as_ref()
                        .map(|secret| secret.client_secret.clone())
                });
                (Some(invoice.id.clone()), secret)
            }
            None => (None, None),
        };
        let price = subscription.first_item().and_then(|item| item.price.as_ref());

        Ok(SubscriptionOutcome {
            external_subscription_id: subscription.id.clone(),
            status: subscription.status.clone(),
            latest_invoice_id,
            client_secret,
            cancel_at_period_end: subscription.cancel_at_period_end,
            current_period_start: subscription.period_start().and_then(timestamp),
            current_period_end: subscription.period_end().and_then(timestamp),
            amount_minor: price.and_then(|price| price.unit_amount),
            currency: price.map(|price| price.currency.to_ascii_lowercase()),
        })
    }

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let url = self.resource_path("subscriptions", external_subscription_id, "")?;
        let request = if cancel_at_period_end {
            self.client
                .post(url)
                .form(&[("cancel_at_period_end", "true")])
        } else {
            self.client.delete(url)
        };
        let subscription: SubscriptionObject = self.send("cancel subscription", request).await?;
        info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            cancel_at_period_end = subscription.cancel_at_period_end,
            "subscription cancellation requested"
        );
        Ok(subscription.snapshot())
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot> {
        let price: PriceObject = self
            .send(
                "retrieve price",
                self.client.get(self.resource_path("prices", price_id, "")?),
            )
            .await?;
        let amount_minor = price.unit_amount.ok_or_else(|| {
            BillingError::ExternalService(format!("price {} has no unit amount", price.id))
        })?;
        Ok(PriceSnapshot {
            price_id: price.id,
            amount_minor,
            currency: price.currency.to_ascii_lowercase(),
            interval: price
                .recurring
                .map(|recurring| recurring.interval)
                .unwrap_or_else(|| "one_time".to_string()),
        })
    }

    fn verify_and_decode_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> BillingResult<BillingEvent> {
        verify_signature(
            raw_body,
            signature_header,
            &self.settings.webhook_secret,
            self.settings.webhook_tolerance_secs,
            Utc::now(),
        )?;
        decode_event(raw_body)
    }
}
