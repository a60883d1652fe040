use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{debug, warn};

/// key: notifications -> push fan-out used by billing as a fire-and-forget side effect
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_notification(&self, title: &str, body: &str, data: Value)
        -> NotificationOutcome;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOutcome {
    pub success: bool,
    pub success_count: usize,
    pub failure_count: usize,
}

/// Dispatcher used when no push gateway is configured.
pub struct NoopDispatcher;

#[async_trait]
impl NotificationDispatcher for NoopDispatcher {
    async fn send_notification(&self, title: &str, _body: &str, _data: Value) -> NotificationOutcome {
        debug!(%title, "push notifications disabled; dropping notification");
        NotificationOutcome::default()
    }
}

#[async_trait]
pub trait PushTokenSource: Send + Sync {
    async fn tokens(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl PushTokenSource for PgPool {
    async fn tokens(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT token FROM push_tokens ORDER BY created_at")
            .fetch_all(self)
            .await
            .context("failed to load push tokens")
    }
}

#[async_trait]
impl PushTokenSource for Vec<String> {
    async fn tokens(&self) -> Result<Vec<String>> {
        Ok(self.clone())
    }
}

/// Sends one message per registered device token to an FCM-compatible HTTP endpoint.
pub struct PushDispatcher {
    client: reqwest::Client,
    endpoint: String,
    server_key: Option<String>,
    tokens: Arc<dyn PushTokenSource>,
}

impl PushDispatcher {
    pub fn new(
        endpoint: impl Into<String>,
        server_key: Option<String>,
        tokens: Arc<dyn PushTokenSource>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build push client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            server_key,
            tokens,
        })
    }

    async fn deliver(&self, token: &str, title: &str, body: &str, data: &Value) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "to": token,
            "notification": { "title": title, "body": body },
            "data": data,
        }));
        if let Some(key) = &self.server_key {
            request = request.header(reqwest::header::AUTHORIZATION, format!("key={key}"));
        }
        request
            .send()
            .await
            .context("failed to reach push gateway")?
            .error_for_status()
            .context("push gateway rejected message")?;
        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for PushDispatcher {
    async fn send_notification(&self, title: &str, body: &str, data: Value) -> NotificationOutcome {
        let tokens = match self.tokens.tokens().await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(?err, "could not load push tokens");
                return NotificationOutcome::default();
            }
        };
        if tokens.is_empty() {
            debug!(%title, "no push tokens registered");
            return NotificationOutcome::default();
        }

        let deliveries = tokens
            .iter()
            .map(|token| self.deliver(token, title, body, &data));
        let results = join_all(deliveries).await;
        let success_count = results.iter().filter(|result| result.is_ok()).count();
        for err in results.iter().filter_map(|result| result.as_ref().err()) {
            warn!(?err, "failed to deliver push notification");
        }

        NotificationOutcome {
            success: true,
            success_count,
            failure_count: tokens.len() - success_count,
        }
    }
}
