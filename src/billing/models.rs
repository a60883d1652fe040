use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::BillingError;

/// key: billing-subscription-status -> local lifecycle, `canceled` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    /// Statuses a subscription can still leave.
    pub const LIVE: [Self; 3] = [Self::Incomplete, Self::Active, Self::PastDue];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Maps a raw processor status onto the local lifecycle. Processor states we do not
    /// track separately collapse onto the nearest local one.
    pub fn from_processor(raw: &str) -> Self {
        match raw {
            "active" | "trialing" => Self::Active,
            "past_due" | "unpaid" => Self::PastDue,
            "canceled" | "incomplete_expired" => Self::Canceled,
            _ => Self::Incomplete,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "incomplete" => Ok(Self::Incomplete),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            other => Err(BillingError::Validation(format!(
                "unknown subscription status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(BillingError::Validation(format!(
                "unknown transaction status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Subscription,
    InstantService,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::InstantService => "instant_service",
        }
    }
}

impl FromStr for TransactionType {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "subscription" => Ok(Self::Subscription),
            "instant_service" => Ok(Self::InstantService),
            other => Err(BillingError::Validation(format!(
                "unknown transaction type `{other}`"
            ))),
        }
    }
}

/// key: billing-plan-model -> recurring price reference data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPlan {
    pub id: Uuid,
    pub external_price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub billing_interval: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub external_price_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub billing_interval: String,
}

/// key: billing-subscription-model -> user recurring billing relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub plan_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub is_active: bool,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Entitlement check. A subscription scheduled to cancel at period end keeps access
    /// until `current_period_end` passes.
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        entitled(
            self.status,
            self.cancel_at_period_end,
            self.current_period_end,
            now,
        )
    }
}

pub(crate) fn entitled(
    status: SubscriptionStatus,
    cancel_at_period_end: bool,
    current_period_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if status != SubscriptionStatus::Active {
        return false;
    }
    match (cancel_at_period_end, current_period_end) {
        (true, Some(end)) => end > now,
        _ => true,
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: String,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub plan_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Fields written by a status transition. `None` leaves the stored value untouched.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub status: SubscriptionStatus,
    pub is_active: bool,
    pub cancel_at_period_end: Option<bool>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

impl SubscriptionUpdate {
    pub fn status(status: SubscriptionStatus, is_active: bool) -> Self {
        Self {
            status,
            is_active,
            cancel_at_period_end: None,
            canceled_at: None,
            current_period_start: None,
            current_period_end: None,
        }
    }
}

/// Compare-and-swap guard for subscription writes.
#[derive(Debug, Clone)]
pub struct SubscriptionGuard {
    /// Current statuses the row must be in for the write to apply.
    pub allowed_from: Vec<SubscriptionStatus>,
    /// Processor timestamp of the event driving the write. Rows that already absorbed a
    /// newer event are left alone.
    pub event_at: Option<DateTime<Utc>>,
}

impl SubscriptionGuard {
    pub fn from_statuses(allowed_from: &[SubscriptionStatus]) -> Self {
        Self {
            allowed_from: allowed_from.to_vec(),
            event_at: None,
        }
    }

    pub fn at(mut self, event_at: DateTime<Utc>) -> Self {
        self.event_at = Some(event_at);
        self
    }

    pub fn admits(&self, status: SubscriptionStatus, last_event_at: Option<DateTime<Utc>>) -> bool {
        if !self.allowed_from.contains(&status) {
            return false;
        }
        match (self.event_at, last_event_at) {
            (Some(event_at), Some(last)) => event_at >= last,
            _ => true,
        }
    }
}

/// key: billing-transaction-model -> money movement audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub provider: String,
    pub reference_number: String,
    pub status: TransactionStatus,
    pub amount_minor: i64,
    pub currency: String,
    pub paid_amount_minor: Option<i64>,
    pub paid_currency: Option<String>,
    pub provider_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub provider: String,
    pub reference_number: String,
    pub amount_minor: i64,
    pub currency: String,
    pub provider_status: Option<String>,
}

/// Terminal outcome applied to a pending transaction.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: TransactionStatus,
    pub paid_amount_minor: Option<i64>,
    pub paid_currency: Option<String>,
    pub provider_status: Option<String>,
}

impl Settlement {
    pub fn completed(amount_minor: i64, currency: &str, provider_status: &str) -> Self {
        Self {
            status: TransactionStatus::Completed,
            paid_amount_minor: Some(amount_minor),
            paid_currency: Some(currency.to_ascii_lowercase()),
            provider_status: Some(provider_status.to_string()),
        }
    }

    pub fn failed(provider_status: &str) -> Self {
        Self {
            status: TransactionStatus::Failed,
            paid_amount_minor: None,
            paid_currency: None,
            provider_status: Some(provider_status.to_string()),
        }
    }

    pub fn cancelled(provider_status: &str) -> Self {
        Self {
            status: TransactionStatus::Cancelled,
            paid_amount_minor: None,
            paid_currency: None,
            provider_status: Some(provider_status.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn grace_window_keeps_access_until_period_end() {
        let now = Utc::now();
        assert!(entitled(
            SubscriptionStatus::Active,
            true,
            Some(now + Duration::days(3)),
            now
        ));
        assert!(!entitled(
            SubscriptionStatus::Active,
            true,
            Some(now - Duration::seconds(1)),
            now
        ));
        assert!(entitled(SubscriptionStatus::Active, false, None, now));
        assert!(!entitled(SubscriptionStatus::PastDue, false, None, now));
    }

    #[test]
    fn guard_rejects_older_events_and_foreign_statuses() {
        let now = Utc::now();
        let guard = SubscriptionGuard::from_statuses(&[
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
        ])
        .at(now - Duration::minutes(5));

        assert!(!guard.admits(SubscriptionStatus::Canceled, None));
        assert!(!guard.admits(SubscriptionStatus::Active, Some(now)));
        assert!(guard.admits(SubscriptionStatus::Active, Some(now - Duration::minutes(10))));
        assert!(guard.admits(SubscriptionStatus::PastDue, None));
    }

    #[test]
    fn processor_statuses_collapse_onto_local_lifecycle() {
        assert_eq!(
            SubscriptionStatus::from_processor("trialing"),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_processor("unpaid"),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_processor("incomplete_expired"),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            SubscriptionStatus::from_processor("incomplete"),
            SubscriptionStatus::Incomplete
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }
}
