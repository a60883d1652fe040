use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};

use super::error::BillingError;
use super::gateway::SubscriptionSnapshot;
use super::models::Subscription;
use super::service::{BillingService, Checkout, PaymentReceipt, SubscribeReceipt};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// key: billing-api -> processor webhook and checkout endpoints
pub async fn payment_webhook(
    Extension(service): Extension<BillingService>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if provider != service.provider() {
        return (StatusCode::NOT_FOUND, Json(json!({ "received": false })));
    }

    let header = format!("{provider}-signature");
    let Some(signature) = headers
        .get(header.as_str())
        .and_then(|value| value.to_str().ok())
    else {
        warn!(%provider, "webhook delivered without signature header");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing signature" })),
        );
    };

    let handled = tokio::time::timeout(
        service.webhook_timeout(),
        service.handle_webhook(&body, signature),
    )
    .await;
    match handled {
        Ok(Ok(_)) => (StatusCode::OK, Json(json!({ "received": true }))),
        Ok(Err(BillingError::SignatureInvalid(reason))) => {
            warn!(%provider, %reason, "rejected webhook with invalid signature");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid signature" })),
            )
        }
        Ok(Err(BillingError::Validation(reason))) => {
            warn!(%provider, %reason, "rejected undecodable webhook payload");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid payload" })),
            )
        }
        Ok(Err(err)) => {
            error!(?err, %provider, "webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "webhook processing failed" })),
            )
        }
        Err(_) => {
            error!(%provider, timeout = ?service.webhook_timeout(), "webhook processing timed out");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "webhook processing timed out" })),
            )
        }
    }
}

pub async fn subscribe(
    Extension(service): Extension<BillingService>,
    Path(provider): Path<String>,
    Json(payload): Json<SubscribeRequest>,
) -> AppResult<Json<SubscribeResponse>> {
    ensure_provider(&service, &provider)?;
    let (user_id, checkout) = payload.into_checkout()?;
    let receipt = service.subscribe(&user_id, checkout).await?;
    Ok(Json(SubscribeResponse {
        success: true,
        message: "Subscription created".into(),
        receipt,
    }))
}

pub async fn cancel_subscription(
    Extension(service): Extension<BillingService>,
    Path(provider): Path<String>,
    user: AuthUser,
    Json(payload): Json<CancelSubscriptionRequest>,
) -> AppResult<Json<ApiResponse<SubscriptionSnapshot>>> {
    ensure_provider(&service, &provider)?;
    let subscription_id = required("subscriptionId", payload.subscription_id)?;
    let snapshot = service
        .cancel_subscription(&user.user_id, &subscription_id, payload.cancel_at_period_end)
        .await?;
    let message = if payload.cancel_at_period_end {
        "Subscription will be canceled at the end of the billing period"
    } else {
        "Subscription canceled"
    };
    Ok(Json(ApiResponse::ok(message, snapshot)))
}

pub async fn instant_payment(
    Extension(service): Extension<BillingService>,
    Path(provider): Path<String>,
    user: AuthUser,
    Json(payload): Json<InstantPaymentRequest>,
) -> AppResult<Json<ApiResponse<PaymentReceipt>>> {
    ensure_provider(&service, &provider)?;
    let user_id = match payload.user_id {
        Some(user_id) if user_id != user.user_id => return Err(AppError::Forbidden),
        _ => user.user_id,
    };
    let email = required("email", payload.email)?;
    let payment_method_id = required("paymentMethodId", payload.payment_method_id)?;
    let amount = payload
        .amount
        .ok_or_else(|| AppError::BadRequest("amount is required".into()))?;
    let currency = payload.currency.unwrap_or_else(|| "usd".to_string());

    let receipt = service
        .instant_payment(&user_id, &email, &payment_method_id, amount, &currency)
        .await?;
    Ok(Json(ApiResponse::ok("Payment created", receipt)))
}

pub async fn current_subscription(
    Extension(service): Extension<BillingService>,
    Path(provider): Path<String>,
    user: AuthUser,
) -> AppResult<Json<ApiResponse<Subscription>>> {
    ensure_provider(&service, &provider)?;
    let subscription = service
        .active_subscription(&user.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(ApiResponse::ok("Active subscription", subscription)))
}

fn ensure_provider(service: &BillingService, provider: &str) -> AppResult<()> {
    if provider == service.provider() {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, BillingError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BillingError::Validation(format!("{field} is required")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub payment_method_id: Option<String>,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
}

impl SubscribeRequest {
    /// Accepts either `{email, paymentMethodId}` or `{customerId, priceId?}` alongside `userId`.
    pub fn into_checkout(self) -> Result<(String, Checkout), BillingError> {
        let user_id = required("userId", self.user_id)?;
        let checkout = match (self.customer_id, self.email, self.payment_method_id) {
            (Some(customer_id), _, _) => Checkout::Customer {
                customer_id: required("customerId", Some(customer_id))?,
                price_id: self.price_id.filter(|price_id| !price_id.trim().is_empty()),
            },
            (None, email, payment_method_id) => Checkout::Card {
                email: required("email", email)?,
                payment_method_id: required("paymentMethodId", payment_method_id)?,
            },
        };
        Ok((user_id, checkout))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSubscriptionRequest {
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantPaymentRequest {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub payment_method_id: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub receipt: SubscribeReceipt,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(message: &str, data: T) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            data,
        }
    }
}
