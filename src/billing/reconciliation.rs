use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::error::{BillingError, BillingResult};
use super::gateway::{
    BillingEvent, BillingEventKind, BillingGateway, InvoiceEvent, PaymentIntentEvent,
    SubscriptionEvent,
};
use super::models::{
    entitled, BillingPlan, NewPlan, NewSubscription, NewTransaction, PaymentTransaction, Settlement,
    Subscription, SubscriptionGuard, SubscriptionStatus, SubscriptionUpdate, TransactionType,
};
use super::store::BillingStore;
use crate::notifications::NotificationDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    /// The event was handled. Individual guarded writes may still have matched nothing.
    Applied,
    /// A processed marker already exists for this event id.
    Duplicate,
    /// The event referenced records that could not be found or backfilled.
    Skipped,
    /// The event kind is not tracked.
    Ignored,
}

/// key: billing-reconciliation -> maps verified processor events onto guarded store writes
///
/// Every write is conditional, so replays and out-of-order deliveries converge on the same
/// state. The processed marker is written last; a failed attempt is redelivered in full.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn BillingGateway>,
    notifier: Arc<dyn NotificationDispatcher>,
}

/// Identifies the subscription an event points at, plus what is needed to backfill it.
struct SubscriptionRef<'a> {
    subscription_id: &'a str,
    customer_id: &'a str,
    user_id: Option<&'a str>,
    price_id: Option<&'a str>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn BillingGateway>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
        }
    }

    pub async fn apply(&self, event: BillingEvent) -> BillingResult<ReconciliationOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            debug!(event_id = %event.id, "billing event already processed");
            return Ok(ReconciliationOutcome::Duplicate);
        }

        let kind = event.kind.label().to_string();
        let event_at = event.created_at;
        let outcome = match event.kind {
            BillingEventKind::RecurringPaymentSucceeded(invoice) => {
                self.recurring_payment_succeeded(event_at, invoice).await?
            }
            BillingEventKind::RecurringPaymentFailed(invoice) => {
                self.recurring_payment_failed(event_at, invoice).await?
            }
            BillingEventKind::SubscriptionCanceled(subscription) => {
                self.subscription_canceled(event_at, subscription).await?
            }
            BillingEventKind::SubscriptionUpdated(subscription) => {
                self.subscription_updated(event_at, subscription).await?
            }
            BillingEventKind::OneTimePaymentSucceeded(intent) => {
                self.one_time_payment_succeeded(intent).await?
            }
            BillingEventKind::OneTimePaymentFailed(intent) => {
                self.one_time_payment_failed(intent).await?
            }
            BillingEventKind::Unrecognized { kind } => {
                info!(event_id = %event.id, %kind, "ignoring untracked billing event");
                ReconciliationOutcome::Ignored
            }
        };

        self.store.mark_event_processed(&event.id, &kind).await?;
        info!(event_id = %event.id, %kind, ?outcome, "billing event reconciled");
        Ok(outcome)
    }

    async fn recurring_payment_succeeded(
        &self,
        event_at: DateTime<Utc>,
        invoice: InvoiceEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        let target = SubscriptionRef {
            subscription_id: &invoice.subscription_id,
            customer_id: &invoice.customer_id,
            user_id: invoice.user_id.as_deref(),
            price_id: invoice.price_id.as_deref(),
            period_start: invoice.period_start,
            period_end: invoice.period_end,
        };
        let Some(subscription) = self.locate_or_backfill(target).await? else {
            return Ok(ReconciliationOutcome::Skipped);
        };

        let update = SubscriptionUpdate {
            current_period_start: invoice.period_start,
            current_period_end: invoice.period_end,
            ..SubscriptionUpdate::status(SubscriptionStatus::Active, true)
        };
        self.transition(
            &invoice.subscription_id,
            update,
            SubscriptionGuard::from_statuses(&SubscriptionStatus::LIVE).at(event_at),
        )
        .await?;

        let settlement = Settlement::completed(
            invoice.amount_paid_minor,
            &invoice.currency,
            &invoice.status,
        );
        let settled = self
            .settle(&invoice.subscription_id, settlement.clone())
            .await?;
        if settled.is_none() {
            self.record_paid_invoice(&subscription, &invoice, settlement)
                .await?;
        }

        self.notify(
            "Payment received",
            "Your subscription payment was successful.",
            json!({
                "type": "subscription_payment_succeeded",
                "subscriptionId": invoice.subscription_id,
                "userId": subscription.user_id,
            }),
        );
        Ok(ReconciliationOutcome::Applied)
    }

    async fn recurring_payment_failed(
        &self,
        event_at: DateTime<Utc>,
        invoice: InvoiceEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        let subscription = self
            .store
            .find_subscription_by_external_id(&invoice.subscription_id)
            .await?;
        if subscription.is_none() {
            let err = BillingError::SubscriptionNotFound(invoice.subscription_id.clone());
            warn!(%err, invoice_id = %invoice.invoice_id, "payment failure for unknown subscription");
        }

        self.transition(
            &invoice.subscription_id,
            SubscriptionUpdate::status(SubscriptionStatus::PastDue, false),
            SubscriptionGuard::from_statuses(&SubscriptionStatus::LIVE).at(event_at),
        )
        .await?;
        self.settle(&invoice.subscription_id, Settlement::failed(&invoice.status))
            .await?;

        if let Some(subscription) = subscription {
            self.notify(
                "Payment failed",
                "We could not process your subscription payment.",
                json!({
                    "type": "subscription_payment_failed",
                    "subscriptionId": invoice.subscription_id,
                    "userId": subscription.user_id,
                }),
            );
        }
        Ok(ReconciliationOutcome::Applied)
    }

    async fn subscription_canceled(
        &self,
        event_at: DateTime<Utc>,
        event: SubscriptionEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        let Some(subscription) = self.locate_or_backfill(subscription_ref(&event)).await? else {
            return Ok(ReconciliationOutcome::Skipped);
        };

        // Cancellation is terminal, so it is applied regardless of event age.
        let update = SubscriptionUpdate {
            canceled_at: Some(event.canceled_at.unwrap_or(event_at)),
            ..SubscriptionUpdate::status(SubscriptionStatus::Canceled, false)
        };
        self.transition(
            &event.subscription_id,
            update,
            SubscriptionGuard::from_statuses(&SubscriptionStatus::LIVE),
        )
        .await?;
        self.settle(&event.subscription_id, Settlement::cancelled(&event.raw_status))
            .await?;

        self.notify(
            "Subscription canceled",
            "Your subscription has been canceled.",
            json!({
                "type": "subscription_canceled",
                "subscriptionId": event.subscription_id,
                "userId": subscription.user_id,
            }),
        );
        Ok(ReconciliationOutcome::Applied)
    }

    async fn subscription_updated(
        &self,
        event_at: DateTime<Utc>,
        event: SubscriptionEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        if event.status.is_terminal() {
            return self.subscription_canceled(event_at, event).await;
        }
        if self.locate_or_backfill(subscription_ref(&event)).await?.is_none() {
            return Ok(ReconciliationOutcome::Skipped);
        }

        let update = SubscriptionUpdate {
            status: event.status,
            is_active: entitled(
                event.status,
                event.cancel_at_period_end,
                event.current_period_end,
                Utc::now(),
            ),
            cancel_at_period_end: Some(event.cancel_at_period_end),
            canceled_at: None,
            current_period_start: event.current_period_start,
            current_period_end: event.current_period_end,
        };
        self.transition(
            &event.subscription_id,
            update,
            SubscriptionGuard::from_statuses(&SubscriptionStatus::LIVE).at(event_at),
        )
        .await?;
        Ok(ReconciliationOutcome::Applied)
    }

    async fn one_time_payment_succeeded(
        &self,
        intent: PaymentIntentEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        let paid = if intent.amount_received_minor > 0 {
            intent.amount_received_minor
        } else {
            intent.amount_minor
        };
        let settled = self
            .settle(
                &intent.payment_intent_id,
                Settlement::completed(paid, &intent.currency, &intent.status),
            )
            .await?;
        let Some(transaction) = settled else {
            return Ok(ReconciliationOutcome::Skipped);
        };

        self.notify(
            "Payment received",
            "Your payment was successful.",
            json!({
                "type": "instant_payment_succeeded",
                "paymentIntentId": intent.payment_intent_id,
                "userId": transaction.user_id,
            }),
        );
        Ok(ReconciliationOutcome::Applied)
    }

    async fn one_time_payment_failed(
        &self,
        intent: PaymentIntentEvent,
    ) -> BillingResult<ReconciliationOutcome> {
        let settled = self
            .settle(&intent.payment_intent_id, Settlement::failed(&intent.status))
            .await?;
        Ok(match settled {
            Some(_) => ReconciliationOutcome::Applied,
            None => ReconciliationOutcome::Skipped,
        })
    }

    /// Finds the local subscription, creating it from event data when the event beat the
    /// local create path. Returns `None` when no owning user can be determined.
    async fn locate_or_backfill(
        &self,
        target: SubscriptionRef<'_>,
    ) -> BillingResult<Option<Subscription>> {
        if let Some(existing) = self
            .store
            .find_subscription_by_external_id(target.subscription_id)
            .await?
        {
            return Ok(Some(existing));
        }

        let user_id = match target.user_id {
            Some(user_id) => {
                self.store
                    .link_customer(user_id, target.customer_id)
                    .await?;
                Some(user_id.to_string())
            }
            None => self.store.find_user_by_customer(target.customer_id).await?,
        };
        let Some(user_id) = user_id else {
            let err = BillingError::SubscriptionNotFound(target.subscription_id.to_string());
            warn!(
                %err,
                customer_id = target.customer_id,
                "cannot backfill subscription without a known owner"
            );
            return Ok(None);
        };

        let plan_id = match target.price_id {
            Some(price_id) => Some(self.ensure_plan(price_id).await?.id),
            None => None,
        };
        let subscription = self
            .store
            .create_subscription(NewSubscription {
                user_id,
                external_customer_id: target.customer_id.to_string(),
                external_subscription_id: target.subscription_id.to_string(),
                plan_id,
                status: SubscriptionStatus::Incomplete,
                current_period_start: target.period_start,
                current_period_end: target.period_end,
                cancel_at_period_end: false,
            })
            .await?;
        info!(
            subscription_id = target.subscription_id,
            user_id = %subscription.user_id,
            "backfilled subscription from event data"
        );
        Ok(Some(subscription))
    }

    /// Returns the stored plan for `price_id`, fetching it from the processor on first use.
    pub async fn ensure_plan(&self, price_id: &str) -> BillingResult<BillingPlan> {
        if let Some(plan) = self.store.find_plan_by_price_id(price_id).await? {
            return Ok(plan);
        }
        let price = self.gateway.retrieve_price(price_id).await?;
        let plan = self
            .store
            .create_plan(NewPlan {
                external_price_id: price.price_id,
                amount_minor: price.amount_minor,
                currency: price.currency,
                billing_interval: price.interval,
            })
            .await?;
        info!(price_id, plan_id = %plan.id, "created billing plan");
        Ok(plan)
    }

    async fn transition(
        &self,
        external_subscription_id: &str,
        update: SubscriptionUpdate,
        guard: SubscriptionGuard,
    ) -> BillingResult<bool> {
        let status = update.status;
        let applied = self
            .store
            .update_subscription_status(external_subscription_id, update, guard)
            .await?;
        if applied {
            info!(subscription_id = external_subscription_id, %status, "subscription transitioned");
        } else {
            debug!(
                subscription_id = external_subscription_id,
                %status,
                "subscription transition rejected by guard"
            );
        }
        Ok(applied)
    }

    /// Settles the pending transaction for `reference`. A missing pending row is a
    /// tolerated race and yields `None`.
    async fn settle(
        &self,
        reference: &str,
        settlement: Settlement,
    ) -> BillingResult<Option<PaymentTransaction>> {
        let Some(transaction) = self
            .store
            .find_pending_transaction_by_reference(reference)
            .await?
        else {
            let err = BillingError::TransactionNotFound(reference.to_string());
            info!(%err, "nothing to settle");
            return Ok(None);
        };

        let status = settlement.status;
        if self
            .store
            .settle_transaction(transaction.id, settlement)
            .await?
        {
            info!(transaction_id = %transaction.id, reference, %status, "transaction settled");
        } else {
            debug!(transaction_id = %transaction.id, reference, "transaction already settled");
        }
        Ok(Some(transaction))
    }

    /// Records a paid invoice that had no pending row to settle. Either it renews the
    /// subscription, or it arrived before the subscribe call wrote its own row, in which
    /// case that later insert finds this completed row instead of adding a pending one.
    async fn record_paid_invoice(
        &self,
        subscription: &Subscription,
        invoice: &InvoiceEvent,
        settlement: Settlement,
    ) -> BillingResult<()> {
        let reference = invoice.transaction_reference();
        let transaction = self
            .store
            .create_transaction(NewTransaction {
                user_id: subscription.user_id.clone(),
                transaction_type: TransactionType::Subscription,
                provider: self.gateway.provider().to_string(),
                reference_number: reference.to_string(),
                amount_minor: invoice.amount_due_minor,
                currency: invoice.currency.to_ascii_lowercase(),
                provider_status: Some(invoice.status.clone()),
            })
            .await?;
        if self
            .store
            .settle_transaction(transaction.id, settlement)
            .await?
        {
            info!(
                transaction_id = %transaction.id,
                invoice_id = %invoice.invoice_id,
                reference,
                "paid invoice transaction recorded"
            );
        }
        Ok(())
    }

    fn notify(&self, title: &'static str, body: &'static str, data: Value) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let outcome = notifier.send_notification(title, body, data).await;
            debug!(
                title,
                success = outcome.success,
                delivered = outcome.success_count,
                failed = outcome.failure_count,
                "billing notification dispatched"
            );
        });
    }
}

fn subscription_ref(event: &SubscriptionEvent) -> SubscriptionRef<'_> {
    SubscriptionRef {
        subscription_id: &event.subscription_id,
        customer_id: &event.customer_id,
        user_id: event.user_id.as_deref(),
        price_id: None,
        period_start: event.current_period_start,
        period_end: event.current_period_end,
    }
}
