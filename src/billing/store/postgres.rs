use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::BillingStore;
use crate::billing::models::{
    BillingPlan, NewPlan, NewSubscription, NewTransaction, PaymentTransaction, Settlement,
    Subscription, SubscriptionGuard, SubscriptionUpdate,
};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, external_customer_id, external_subscription_id, \
    plan_id, status, is_active, current_period_start, current_period_end, cancel_at_period_end, \
    canceled_at, last_event_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, transaction_type, provider, reference_number, \
    status, amount_minor, currency, paid_amount_minor, paid_currency, provider_status, \
    created_at, updated_at";

/// key: billing-store-postgres -> guarded writes over the billing tables
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: String,
    external_customer_id: String,
    external_subscription_id: String,
    plan_id: Option<Uuid>,
    status: String,
    is_active: bool,
    current_period_start: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    canceled_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = anyhow::Error;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            external_customer_id: row.external_customer_id,
            external_subscription_id: row.external_subscription_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            is_active: row.is_active,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: String,
    transaction_type: String,
    provider: String,
    reference_number: String,
    status: String,
    amount_minor: i64,
    currency: String,
    paid_amount_minor: Option<i64>,
    paid_currency: Option<String>,
    provider_status: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = anyhow::Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(PaymentTransaction {
            id: row.id,
            user_id: row.user_id,
            transaction_type: row.transaction_type.parse()?,
            provider: row.provider,
            reference_number: row.reference_number,
            status: row.status.parse()?,
            amount_minor: row.amount_minor,
            currency: row.currency,
            paid_amount_minor: row.paid_amount_minor,
            paid_currency: row.paid_currency,
            provider_status: row.provider_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    id: Uuid,
    external_price_id: String,
    amount_minor: i64,
    currency: String,
    billing_interval: String,
    created_at: DateTime<Utc>,
}

impl From<PlanRow> for BillingPlan {
    fn from(row: PlanRow) -> Self {
        BillingPlan {
            id: row.id,
            external_price_id: row.external_price_id,
            amount_minor: row.amount_minor,
            currency: row.currency,
            billing_interval: row.billing_interval,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE external_subscription_id = $1 AND deleted_at IS NULL"
        ))
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load subscription by external id")?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_subscription_for_user(
        &self,
        external_subscription_id: &str,
        user_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE external_subscription_id = $1 AND user_id = $2 AND deleted_at IS NULL"
        ))
        .bind(external_subscription_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load subscription for user")?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_active_subscription_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1
              AND status = 'active'
              AND deleted_at IS NULL
              AND (cancel_at_period_end = FALSE
                   OR current_period_end IS NULL
                   OR current_period_end > $2)
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load active subscription")?;
        row.map(Subscription::try_from).transpose()
    }

    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        let is_active = subscription.status == crate::billing::SubscriptionStatus::Active;
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id,
                user_id,
                external_customer_id,
                external_subscription_id,
                plan_id,
                status,
                is_active,
                current_period_start,
                current_period_end,
                cancel_at_period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (external_subscription_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&subscription.user_id)
        .bind(&subscription.external_customer_id)
        .bind(&subscription.external_subscription_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(is_active)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .execute(&self.pool)
        .await
        .context("failed to insert subscription")?;

        self.find_subscription_by_external_id(&subscription.external_subscription_id)
            .await?
            .context("subscription vanished after insert")
    }

    async fn update_subscription_status(
        &self,
        external_subscription_id: &str,
        update: SubscriptionUpdate,
        guard: SubscriptionGuard,
    ) -> Result<bool> {
        let allowed: Vec<String> = guard
            .allowed_from
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $2,
                is_active = $3,
                cancel_at_period_end = COALESCE($4, cancel_at_period_end),
                canceled_at = COALESCE($5, canceled_at),
                current_period_start = COALESCE($6, current_period_start),
                current_period_end = COALESCE($7, current_period_end),
                last_event_at = GREATEST(last_event_at, $8),
                updated_at = NOW()
            WHERE external_subscription_id = $1
              AND deleted_at IS NULL
              AND status = ANY($9)
              AND ($8::timestamptz IS NULL OR last_event_at IS NULL OR last_event_at <= $8)
            "#,
        )
        .bind(external_subscription_id)
        .bind(update.status.as_str())
        .bind(update.is_active)
        .bind(update.cancel_at_period_end)
        .bind(update.canceled_at)
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(guard.event_at)
        .bind(allowed)
        .execute(&self.pool)
        .await
        .context("failed to update subscription status")?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_pending_transaction_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions \
             WHERE reference_number = $1 AND status = 'pending'"
        ))
        .bind(reference_number)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load pending transaction")?;
        row.map(PaymentTransaction::try_from).transpose()
    }

    async fn create_transaction(&self, transaction: NewTransaction) -> Result<PaymentTransaction> {
        sqlx::query(
            r#"
            INSERT INTO payment_transactions (
                id,
                user_id,
                transaction_type,
                provider,
                reference_number,
                status,
                amount_minor,
                currency,
                provider_status
            ) VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8)
            ON CONFLICT (reference_number) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&transaction.user_id)
        .bind(transaction.transaction_type.as_str())
        .bind(&transaction.provider)
        .bind(&transaction.reference_number)
        .bind(transaction.amount_minor)
        .bind(&transaction.currency)
        .bind(&transaction.provider_status)
        .execute(&self.pool)
        .await
        .context("failed to insert payment transaction")?;

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions WHERE reference_number = $1"
        ))
        .bind(&transaction.reference_number)
        .fetch_one(&self.pool)
        .await
        .context("failed to reload payment transaction")?;
        row.try_into()
    }

    async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_transactions SET
                status = $2,
                paid_amount_minor = COALESCE($3, paid_amount_minor),
                paid_currency = COALESCE($4, paid_currency),
                provider_status = COALESCE($5, provider_status),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(transaction_id)
        .bind(settlement.status.as_str())
        .bind(settlement.paid_amount_minor)
        .bind(&settlement.paid_currency)
        .bind(&settlement.provider_status)
        .execute(&self.pool)
        .await
        .context("failed to settle payment transaction")?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_plan_by_price_id(&self, price_id: &str) -> Result<Option<BillingPlan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            "SELECT id, external_price_id, amount_minor, currency, billing_interval, created_at \
             FROM billing_plans WHERE external_price_id = $1",
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load plan")?;
        Ok(row.map(BillingPlan::from))
    }

    async fn create_plan(&self, plan: NewPlan) -> Result<BillingPlan> {
        sqlx::query(
            r#"
            INSERT INTO billing_plans (id, external_price_id, amount_minor, currency, billing_interval)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_price_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&plan.external_price_id)
        .bind(plan.amount_minor)
        .bind(&plan.currency)
        .bind(&plan.billing_interval)
        .execute(&self.pool)
        .await
        .context("failed to insert plan")?;

        self.find_plan_by_price_id(&plan.external_price_id)
            .await?
            .context("plan vanished after insert")
    }

    async fn link_customer(&self, user_id: &str, customer_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET billing_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await
            .context("failed to link billing customer to user")?;
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> Result<Option<String>> {
        let user_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM users WHERE billing_id = $1 LIMIT 1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to resolve user by billing customer")?;
        Ok(user_id)
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        let seen: Option<String> = sqlx::query_scalar(
            "SELECT event_id FROM processed_billing_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check processed billing events")?;
        Ok(seen.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str, kind: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO processed_billing_events (event_id, kind) VALUES ($1, $2) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(kind)
        .execute(&self.pool)
        .await
        .context("failed to record processed billing event")?;
        Ok(())
    }
}
