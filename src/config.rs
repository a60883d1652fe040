use once_cell::sync::Lazy;
use std::fs;

use crate::billing::stripe::StripeSettings;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: billing-config -> processor credentials, loaded once and never mutated
pub static STRIPE_SETTINGS: Lazy<StripeSettings> = Lazy::new(stripe_settings_from_env);

/// key: billing-config -> upper bound for a single webhook delivery before we answer 503
pub static WEBHOOK_HANDLER_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("WEBHOOK_HANDLER_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// Push gateway used for billing notifications. Notifications are disabled when unset.
pub static PUSH_ENDPOINT: Lazy<Option<String>> = Lazy::new(|| read_optional_env("PUSH_ENDPOINT"));

/// Server key presented to the push gateway. `PUSH_SERVER_KEY_FILE` takes precedence.
pub static PUSH_SERVER_KEY: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("PUSH_SERVER_KEY", "PUSH_SERVER_KEY_FILE"));

pub fn stripe_settings_from_env() -> StripeSettings {
    let secret_key = read_secret_env("STRIPE_SECRET_KEY", "STRIPE_SECRET_KEY_FILE")
        .expect("STRIPE_SECRET_KEY must be set");
    let webhook_secret = read_secret_env("STRIPE_WEBHOOK_SECRET", "STRIPE_WEBHOOK_SECRET_FILE")
        .expect("STRIPE_WEBHOOK_SECRET must be set");
    let monthly_price_id =
        read_optional_env("STRIPE_MONTHLY_PRICE_ID").expect("STRIPE_MONTHLY_PRICE_ID must be set");
    let api_base = read_optional_env("STRIPE_API_BASE")
        .unwrap_or_else(|| "https://api.stripe.com".to_string());
    let return_url = read_optional_env("STRIPE_RETURN_URL")
        .unwrap_or_else(|| "http://localhost:3000/payment/complete".to_string());
    let webhook_tolerance_secs = std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300);

    StripeSettings {
        secret_key,
        webhook_secret,
        monthly_price_id,
        api_base,
        return_url,
        webhook_tolerance_secs,
    }
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}
