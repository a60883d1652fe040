use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use super::amount::{normalize_currency, to_minor_units};
use super::error::{BillingError, BillingResult};
use super::gateway::{BillingGateway, SubscriptionSnapshot};
use super::models::{
    entitled, NewSubscription, NewTransaction, Subscription, SubscriptionGuard,
    SubscriptionStatus, SubscriptionUpdate, TransactionType,
};
use super::reconciliation::{ReconciliationEngine, ReconciliationOutcome};
use super::store::BillingStore;
use crate::notifications::NotificationDispatcher;

const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// How the caller identifies the processor customer for a new subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Checkout {
    /// Look the customer up by email (creating it when absent) and attach the card.
    Card {
        email: String,
        payment_method_id: String,
    },
    /// The customer already exists at the processor.
    Customer {
        customer_id: String,
        price_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeReceipt {
    pub customer_id: String,
    pub subscription_id: String,
    pub status: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub payment_intent_id: String,
    pub status: String,
    pub client_secret: Option<String>,
}

/// key: billing-service -> user-initiated billing flows
///
/// Charges and subscriptions are created at the processor first. Local rows are written
/// only after the processor accepted the request, and always start out `pending`.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn BillingGateway>,
    engine: ReconciliationEngine,
    default_price_id: String,
    webhook_timeout: Duration,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn BillingGateway>,
        notifier: Arc<dyn NotificationDispatcher>,
        default_price_id: impl Into<String>,
    ) -> Self {
        let engine = ReconciliationEngine::new(store.clone(), gateway.clone(), notifier);
        Self {
            store,
            gateway,
            engine,
            default_price_id: default_price_id.into(),
            webhook_timeout: DEFAULT_WEBHOOK_TIMEOUT,
        }
    }

    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    pub fn webhook_timeout(&self) -> Duration {
        self.webhook_timeout
    }

    pub fn provider(&self) -> &str {
        self.gateway.provider()
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Verifies the raw delivery and hands the decoded event to the reconciliation engine.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
    ) -> BillingResult<ReconciliationOutcome> {
        let event = self
            .gateway
            .verify_and_decode_webhook(raw_body, signature_header)?;
        self.engine.apply(event).await
    }

    pub async fn subscribe(
        &self,
        user_id: &str,
        checkout: Checkout,
    ) -> BillingResult<SubscribeReceipt> {
        let metadata = owner_metadata(user_id);
        let (customer_id, price_id) = match checkout {
            Checkout::Card {
                email,
                payment_method_id,
            } => {
                let customer_id = self
                    .gateway
                    .create_or_reuse_customer(&email, &metadata)
                    .await?;
                self.gateway
                    .attach_payment_method(&customer_id, &payment_method_id)
                    .await?;
                (customer_id, self.default_price_id.clone())
            }
            Checkout::Customer {
                customer_id,
                price_id,
            } => (
                customer_id,
                price_id.unwrap_or_else(|| self.default_price_id.clone()),
            ),
        };

        let plan = self.engine.ensure_plan(&price_id).await?;
        let outcome = self
            .gateway
            .create_subscription(&customer_id, &price_id, &metadata)
            .await?;

        self.store.link_customer(user_id, &customer_id).await?;
        let subscription = self
            .store
            .create_subscription(NewSubscription {
                user_id: user_id.to_string(),
                external_customer_id: customer_id.clone(),
                external_subscription_id: outcome.external_subscription_id.clone(),
                plan_id: Some(plan.id),
                status: SubscriptionStatus::from_processor(&outcome.status),
                current_period_start: outcome.current_period_start,
                current_period_end: outcome.current_period_end,
                cancel_at_period_end: outcome.cancel_at_period_end,
            })
            .await?;
        let transaction = self
            .store
            .create_transaction(NewTransaction {
                user_id: user_id.to_string(),
                transaction_type: TransactionType::Subscription,
                provider: self.gateway.provider().to_string(),
                reference_number: outcome.external_subscription_id.clone(),
                amount_minor: outcome.amount_minor.unwrap_or(plan.amount_minor),
                currency: outcome.currency.clone().unwrap_or(plan.currency),
                provider_status: Some(outcome.status.clone()),
            })
            .await?;
        info!(
            user_id,
            customer_id = %customer_id,
            subscription_id = %subscription.external_subscription_id,
            transaction_id = %transaction.id,
            status = %outcome.status,
            "subscription created"
        );

        Ok(SubscribeReceipt {
            customer_id,
            subscription_id: outcome.external_subscription_id,
            status: outcome.status,
            client_secret: outcome.client_secret,
        })
    }

    pub async fn instant_payment(
        &self,
        user_id: &str,
        email: &str,
        payment_method_id: &str,
        amount: f64,
        currency: &str,
    ) -> BillingResult<PaymentReceipt> {
        let currency = normalize_currency(currency)?;
        let amount_minor = to_minor_units(amount, &currency)?;

        let customer_id = self
            .gateway
            .create_or_reuse_customer(email, &owner_metadata(user_id))
            .await?;
        self.gateway
            .attach_payment_method(&customer_id, payment_method_id)
            .await?;
        let charge = self
            .gateway
            .create_one_time_charge(&customer_id, payment_method_id, amount_minor, &currency)
            .await?;

        self.store.link_customer(user_id, &customer_id).await?;
        let transaction = self
            .store
            .create_transaction(NewTransaction {
                user_id: user_id.to_string(),
                transaction_type: TransactionType::InstantService,
                provider: self.gateway.provider().to_string(),
                reference_number: charge.external_payment_id.clone(),
                amount_minor,
                currency,
                provider_status: Some(charge.status.clone()),
            })
            .await?;
        info!(
            user_id,
            payment_intent_id = %charge.external_payment_id,
            transaction_id = %transaction.id,
            amount_minor,
            status = %charge.status,
            "instant payment created"
        );

        Ok(PaymentReceipt {
            payment_intent_id: charge.external_payment_id,
            status: charge.status,
            client_secret: charge.client_secret,
        })
    }

    /// Requests cancellation at the processor and mirrors the synchronous answer locally.
    pub async fn cancel_subscription(
        &self,
        user_id: &str,
        external_subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let subscription = self.owned_subscription(user_id, external_subscription_id).await?;
        if subscription.status.is_terminal() {
            return Err(BillingError::Validation(format!(
                "subscription `{external_subscription_id}` is already canceled"
            )));
        }

        let snapshot = self
            .gateway
            .cancel_subscription(external_subscription_id, cancel_at_period_end)
            .await?;

        let update = if cancel_at_period_end {
            let period_end = snapshot
                .current_period_end
                .or(subscription.current_period_end);
            SubscriptionUpdate {
                status: subscription.status,
                is_active: entitled(subscription.status, true, period_end, Utc::now()),
                cancel_at_period_end: Some(true),
                canceled_at: None,
                current_period_start: None,
                current_period_end: snapshot.current_period_end,
            }
        } else {
            SubscriptionUpdate {
                canceled_at: Some(snapshot.canceled_at.unwrap_or_else(Utc::now)),
                ..SubscriptionUpdate::status(SubscriptionStatus::Canceled, false)
            }
        };
        // A period-end cancel rewrites the status it read, so it only lands if no webhook
        // moved the row meanwhile. The processor's update event carries the flag otherwise.
        let guard = if cancel_at_period_end {
            SubscriptionGuard::from_statuses(&[subscription.status])
        } else {
            SubscriptionGuard::from_statuses(&SubscriptionStatus::LIVE)
        };
        let applied = self
            .store
            .update_subscription_status(external_subscription_id, update, guard)
            .await?;
        info!(
            user_id,
            subscription_id = external_subscription_id,
            cancel_at_period_end,
            applied,
            "subscription cancellation recorded"
        );

        Ok(snapshot)
    }

    pub async fn active_subscription(&self, user_id: &str) -> BillingResult<Option<Subscription>> {
        Ok(self
            .store
            .find_active_subscription_for_user(user_id, Utc::now())
            .await?)
    }

    async fn owned_subscription(
        &self,
        user_id: &str,
        external_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        if let Some(subscription) = self
            .store
            .find_subscription_for_user(external_subscription_id, user_id)
            .await?
        {
            return Ok(subscription);
        }
        match self
            .store
            .find_subscription_by_external_id(external_subscription_id)
            .await?
        {
            Some(_) => Err(BillingError::Forbidden),
            None => Err(BillingError::SubscriptionNotFound(
                external_subscription_id.to_string(),
            )),
        }
    }
}

fn owner_metadata(user_id: &str) -> HashMap<String, String> {
    HashMap::from([("user_id".to_string(), user_id.to_string())])
}
