mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    BillingPlan, NewPlan, NewSubscription, NewTransaction, PaymentTransaction, Settlement,
    Subscription, SubscriptionGuard, SubscriptionUpdate,
};

/// key: billing-store -> persistence contract consumed by the reconciliation engine
///
/// Every mutating call is a conditional write. Callers learn whether the write applied
/// from the returned flag; a write that loses its guard is not an error.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn find_subscription_for_user(
        &self,
        external_subscription_id: &str,
        user_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn find_active_subscription_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;

    /// Inserts the subscription, or returns the row already stored for the same external id.
    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription>;

    async fn update_subscription_status(
        &self,
        external_subscription_id: &str,
        update: SubscriptionUpdate,
        guard: SubscriptionGuard,
    ) -> Result<bool>;

    async fn find_pending_transaction_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<PaymentTransaction>>;

    /// Always stores a `pending` row. A second create for the same reference returns the
    /// first row untouched.
    async fn create_transaction(&self, transaction: NewTransaction) -> Result<PaymentTransaction>;

    /// Applies `settlement` only while the row is still `pending`.
    async fn settle_transaction(&self, transaction_id: Uuid, settlement: Settlement)
        -> Result<bool>;

    async fn find_plan_by_price_id(&self, price_id: &str) -> Result<Option<BillingPlan>>;

    async fn create_plan(&self, plan: NewPlan) -> Result<BillingPlan>;

    async fn link_customer(&self, user_id: &str, customer_id: &str) -> Result<()>;

    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>>;

    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    async fn mark_event_processed(&self, event_id: &str, kind: &str) -> Result<()>;
}
