use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::BillingStore;
use crate::billing::models::{
    entitled, BillingPlan, NewPlan, NewSubscription, NewTransaction, PaymentTransaction,
    Settlement, Subscription, SubscriptionGuard, SubscriptionStatus, SubscriptionUpdate,
    TransactionStatus,
};

/// key: billing-store-memory -> process-local store for tests and local runs
///
/// Conditional writes run while holding the entry's shard, which gives the same
/// compare-and-swap behaviour as the guarded SQL updates.
#[derive(Default)]
pub struct MemoryBillingStore {
    subscriptions: DashMap<String, Subscription>,
    transactions: DashMap<Uuid, PaymentTransaction>,
    transaction_refs: DashMap<String, Uuid>,
    plans: DashMap<String, BillingPlan>,
    customers: DashMap<String, String>,
    processed_events: DashMap<String, String>,
    writes: AtomicU64,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that changed state.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn transactions(&self) -> Vec<PaymentTransaction> {
        let mut rows: Vec<_> = self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|tx| tx.created_at);
        rows
    }

    pub fn transaction_by_reference(&self, reference_number: &str) -> Option<PaymentTransaction> {
        let id = *self.transaction_refs.get(reference_number)?;
        self.transactions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn plans(&self) -> Vec<BillingPlan> {
        self.plans.iter().map(|entry| entry.value().clone()).collect()
    }

    fn bump(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .subscriptions
            .get(external_subscription_id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_subscription_for_user(
        &self,
        external_subscription_id: &str,
        user_id: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .subscriptions
            .get(external_subscription_id)
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_active_subscription_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .filter(|entry| {
                entitled(
                    entry.status,
                    entry.cancel_at_period_end,
                    entry.current_period_end,
                    now,
                )
            })
            .max_by_key(|entry| entry.updated_at)
            .map(|entry| entry.value().clone()))
    }

    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        let key = subscription.external_subscription_id.clone();
        let entry = self.subscriptions.entry(key).or_insert_with(|| {
            self.bump();
            let now = Utc::now();
            Subscription {
                id: Uuid::new_v4(),
                user_id: subscription.user_id,
                external_customer_id: subscription.external_customer_id,
                external_subscription_id: subscription.external_subscription_id,
                plan_id: subscription.plan_id,
                status: subscription.status,
                is_active: subscription.status == SubscriptionStatus::Active,
                current_period_start: subscription.current_period_start,
                current_period_end: subscription.current_period_end,
                cancel_at_period_end: subscription.cancel_at_period_end,
                canceled_at: None,
                last_event_at: None,
                created_at: now,
                updated_at: now,
            }
        });
        Ok(entry.value().clone())
    }

    async fn update_subscription_status(
        &self,
        external_subscription_id: &str,
        update: SubscriptionUpdate,
        guard: SubscriptionGuard,
    ) -> Result<bool> {
        let Some(mut row) = self.subscriptions.get_mut(external_subscription_id) else {
            return Ok(false);
        };
        if !guard.admits(row.status, row.last_event_at) {
            return Ok(false);
        }
        row.status = update.status;
        row.is_active = update.is_active;
        if let Some(flag) = update.cancel_at_period_end {
            row.cancel_at_period_end = flag;
        }
        if update.canceled_at.is_some() {
            row.canceled_at = update.canceled_at;
        }
        if update.current_period_start.is_some() {
            row.current_period_start = update.current_period_start;
        }
        if update.current_period_end.is_some() {
            row.current_period_end = update.current_period_end;
        }
        row.last_event_at = match (row.last_event_at, guard.event_at) {
            (Some(last), Some(event_at)) => Some(last.max(event_at)),
            (last, event_at) => last.or(event_at),
        };
        row.updated_at = Utc::now();
        self.bump();
        Ok(true)
    }

    async fn find_pending_transaction_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .transaction_by_reference(reference_number)
            .filter(|tx| tx.status == TransactionStatus::Pending))
    }

    async fn create_transaction(&self, transaction: NewTransaction) -> Result<PaymentTransaction> {
        let id = *self
            .transaction_refs
            .entry(transaction.reference_number.clone())
            .or_insert_with(|| {
                let now = Utc::now();
                let row = PaymentTransaction {
                    id: Uuid::new_v4(),
                    user_id: transaction.user_id,
                    transaction_type: transaction.transaction_type,
                    provider: transaction.provider,
                    reference_number: transaction.reference_number,
                    status: TransactionStatus::Pending,
                    amount_minor: transaction.amount_minor,
                    currency: transaction.currency,
                    paid_amount_minor: None,
                    paid_currency: None,
                    provider_status: transaction.provider_status,
                    created_at: now,
                    updated_at: now,
                };
                let id = row.id;
                self.transactions.insert(id, row);
                self.bump();
                id
            });
        self.transactions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("transaction {id} missing from index"))
    }

    async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> Result<bool> {
        let Some(mut row) = self.transactions.get_mut(&transaction_id) else {
            return Ok(false);
        };
        if row.status != TransactionStatus::Pending {
            return Ok(false);
        }
        row.status = settlement.status;
        if settlement.paid_amount_minor.is_some() {
            row.paid_amount_minor = settlement.paid_amount_minor;
        }
        if settlement.paid_currency.is_some() {
            row.paid_currency = settlement.paid_currency;
        }
        if settlement.provider_status.is_some() {
            row.provider_status = settlement.provider_status;
        }
        row.updated_at = Utc::now();
        self.bump();
        Ok(true)
    }

    async fn find_plan_by_price_id(&self, price_id: &str) -> Result<Option<BillingPlan>> {
        Ok(self.plans.get(price_id).map(|entry| entry.value().clone()))
    }

    async fn create_plan(&self, plan: NewPlan) -> Result<BillingPlan> {
        let entry = self
            .plans
            .entry(plan.external_price_id.clone())
            .or_insert_with(|| {
                self.bump();
                BillingPlan {
                    id: Uuid::new_v4(),
                    external_price_id: plan.external_price_id,
                    amount_minor: plan.amount_minor,
                    currency: plan.currency,
                    billing_interval: plan.billing_interval,
                    created_at: Utc::now(),
                }
            });
        Ok(entry.value().clone())
    }

    async fn link_customer(&self, user_id: &str, customer_id: &str) -> Result<()> {
        self.customers
            .insert(customer_id.to_string(), user_id.to_string());
        self.bump();
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>> {
        Ok(self
            .customers
            .get(customer_id)
            .map(|entry| entry.value().clone()))
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self.processed_events.contains_key(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str, kind: &str) -> Result<()> {
        if self
            .processed_events
            .insert(event_id.to_string(), kind.to_string())
            .is_none()
        {
            self.bump();
        }
        Ok(())
    }
}
