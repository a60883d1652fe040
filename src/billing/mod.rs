pub mod amount;
pub mod api;
pub mod error;
pub mod gateway;
pub mod models;
pub mod reconciliation;
pub mod service;
pub mod store;
pub mod stripe;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};

pub use error::{BillingError, BillingResult};
pub use gateway::{
    BillingEvent, BillingEventKind, BillingGateway, ChargeOutcome, InvoiceEvent,
    PaymentIntentEvent, PriceSnapshot, SubscriptionEvent, SubscriptionOutcome,
    SubscriptionSnapshot,
};
pub use models::{
    BillingPlan, PaymentTransaction, Subscription, SubscriptionStatus, TransactionStatus,
    TransactionType,
};
pub use reconciliation::{ReconciliationEngine, ReconciliationOutcome};
pub use service::{BillingService, Checkout, PaymentReceipt, SubscribeReceipt};
pub use store::{BillingStore, MemoryBillingStore, PgBillingStore};
pub use stripe::{StripeGateway, StripeSettings};

/// key: billing-routes -> payment endpoints, keyed by processor name
pub fn routes() -> Router {
    Router::new()
        .route("/payment/:provider/webhook", post(api::payment_webhook))
        .route("/payment/:provider/subscribe", post(api::subscribe))
        .route(
            "/payment/:provider/cancel-subscription",
            post(api::cancel_subscription),
        )
        .route("/payment/:provider/instant-payment", post(api::instant_payment))
        .route("/payment/:provider/subscription", get(api::current_subscription))
}
