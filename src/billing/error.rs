use thiserror::Error;

/// key: billing-errors -> every billing failure path maps onto one of these
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("subscription `{0}` not found")]
    SubscriptionNotFound(String),
    #[error("no pending transaction for reference `{0}`")]
    TransactionNotFound(String),
    #[error("payment processor error: {0}")]
    ExternalService(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("subscription does not belong to caller")]
    Forbidden,
    #[error("billing store error: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl BillingError {
    pub fn external(err: impl std::fmt::Display) -> Self {
        Self::ExternalService(err.to_string())
    }
}

impl From<anyhow::Error> for BillingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.into())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
