use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PushGatewayConfig;
use crate::error::{AppError, AppResult};
use crate::services::composer::NotificationContent;
use crate::services::token_store::TokenStore;

/// Per-send delivery options forwarded to the push provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOptions {
    pub sound: Option<String>,
    pub priority: Option<String>,
    /// Provider-side time-to-live in seconds.
    pub ttl: Option<u32>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            sound: Some("default".to_string()),
            priority: Some("high".to_string()),
            ttl: None,
        }
    }
}

/// One wire message addressed to a single device token.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

/// Per-message receipt parsed from a batch response.
#[derive(Debug, Clone, Deserialize)]
pub struct PushTicket {
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl PushTicket {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Provider error code from the ticket details, e.g. "DeviceNotRegistered".
    pub fn error_code(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("error"))
            .and_then(|e| e.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    data: Vec<PushTicket>,
}

/// The external push provider, batched HTTP POST with JSON tickets back.
/// A trait so tests can stand in a scripted gateway.
#[async_trait]
pub trait PushGateway: Send + Sync + 'static {
    async fn send_batch(&self, messages: &[PushMessage]) -> AppResult<Vec<PushTicket>>;
}

pub struct HttpPushGateway {
    client: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl HttpPushGateway {
    pub fn new(config: &PushGatewayConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(AppError::Request)?;

        Ok(HttpPushGateway {
            client,
            url: config.url.clone(),
            access_token: config.access_token.clone(),
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_batch(&self, messages: &[PushMessage]) -> AppResult<Vec<PushTicket>> {
        let mut request = self.client.post(&self.url).json(messages);
        if let Some(ref token) = self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(AppError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::DeliveryFailure(format!(
                "push gateway returned {}: {}",
                status, body
            )));
        }

        let parsed: BatchResponse = response.json().await.map_err(AppError::Request)?;

        if parsed.data.len() != messages.len() {
            tracing::warn!(
                "Push gateway returned {} tickets for {} messages",
                parsed.data.len(),
                messages.len()
            );
        }

        Ok(parsed.data)
    }
}

/// Result of one dispatch call.
#[derive(Debug, Default, Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub messages_sent: usize,
    pub errors: Vec<String>,
    /// Users whose messages failed (batch transport failures included), so
    /// the retry queue can target exactly the failed subset.
    pub failed_user_ids: Vec<String>,
}

/// Sends composed notifications to users' devices in provider-bounded
/// batches, accumulating partial failures instead of aborting the send.
pub struct Dispatcher {
    token_store: TokenStore,
    gateway: Arc<dyn PushGateway>,
    batch_size: usize,
    batch_delay: Duration,
}

impl Dispatcher {
    pub fn new(token_store: TokenStore, gateway: Arc<dyn PushGateway>, config: &PushGatewayConfig) -> Self {
        Dispatcher {
            token_store,
            gateway,
            // The provider rejects batches above its cap no matter what the
            // config says.
            batch_size: config.batch_size.clamp(1, 100),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
        }
    }

    /// Send `content` to every valid device token of the given users.
    ///
    /// A failed batch records one error and the loop continues; per-message
    /// provider failures are parsed out of the ticket list individually.
    /// `success` is true when at least one message went out. Confirmed
    /// tokens get their `last_used` refreshed; tokens the provider reports
    /// as unregistered are deactivated.
    pub async fn send_to_users(
        &self,
        user_ids: &[String],
        content: &NotificationContent,
        options: &SendOptions,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if user_ids.is_empty() {
            outcome.errors.push("no recipients to deliver to".to_string());
            return outcome;
        }

        let resolved = self.token_store.active_tokens_for_users(user_ids).await;

        tracing::debug!(
            "Token resolution: {} valid, {} invalid, {} users without tokens ({} requested)",
            resolved.stats.valid,
            resolved.stats.invalid,
            resolved.stats.missing_users,
            resolved.stats.requested_users
        );

        for invalid in &resolved.invalid_tokens {
            tracing::debug!(
                "Skipping invalid token for user {}: {}",
                invalid.user_id,
                invalid.errors.join("; ")
            );
        }
        if !resolved.missing_users.is_empty() {
            tracing::debug!(
                "{} requested users have no registered tokens",
                resolved.missing_users.len()
            );
        }

        if resolved.tokens.is_empty() {
            outcome
                .errors
                .push("no valid active tokens for requested users".to_string());
            return outcome;
        }

        let messages: Vec<PushMessage> = resolved
            .tokens
            .iter()
            .map(|token| PushMessage {
                to: token.token.clone(),
                title: content.title.clone(),
                body: content.body.clone(),
                data: content.data.clone(),
                sound: options.sound.clone(),
                priority: options.priority.clone(),
                ttl: options.ttl,
            })
            .collect();
        let message_owners: Vec<String> = resolved
            .tokens
            .iter()
            .map(|token| token.user_id.clone())
            .collect();

        let mut confirmed: Vec<String> = Vec::new();
        let mut failed_users: Vec<String> = Vec::new();
        let batch_count = messages.len().div_ceil(self.batch_size);

        for (index, (batch, owners)) in messages
            .chunks(self.batch_size)
            .zip(message_owners.chunks(self.batch_size))
            .enumerate()
        {
            match self.gateway.send_batch(batch).await {
                Ok(tickets) => {
                    for ((message, owner), ticket) in
                        batch.iter().zip(owners.iter()).zip(tickets.iter())
                    {
                        if ticket.is_ok() {
                            if let Some(ref receipt_id) = ticket.id {
                                tracing::trace!("Provider accepted message, receipt {}", receipt_id);
                            }
                            outcome.messages_sent += 1;
                            confirmed.push(message.to.clone());
                        } else {
                            let reason = ticket
                                .message
                                .clone()
                                .unwrap_or_else(|| "provider rejected message".to_string());
                            outcome
                                .errors
                                .push(format!("token {}: {}", message.to, reason));
                            failed_users.push(owner.clone());

                            if ticket.error_code() == Some("DeviceNotRegistered") {
                                self.token_store
                                    .mark_token_invalid(&message.to, "provider: DeviceNotRegistered")
                                    .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Push batch {}/{} failed: {}", index + 1, batch_count, e);
                    outcome.errors.push(format!("batch {}: {}", index + 1, e));
                    failed_users.extend(owners.iter().cloned());
                }
            }

            // Courtesy pause between batches to respect provider rate limits.
            if index + 1 < batch_count && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        if !confirmed.is_empty() {
            self.token_store.touch_delivered(&confirmed).await;
        }

        failed_users.sort_unstable();
        failed_users.dedup();
        outcome.failed_user_ids = failed_users;
        outcome.success = outcome.messages_sent > 0;
        outcome
    }
}
