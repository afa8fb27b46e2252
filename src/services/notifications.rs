use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::services::composer::{compose, DomainEvent};
use crate::services::dispatcher::SendOptions;
use crate::services::retry::PUSH_GATEWAY_DESTINATION;
use crate::AppState;

/// Envelope produced once per notification attempt. Used for the response
/// body and operational logging; never persisted as a queryable entity.
#[derive(Debug, Serialize)]
pub struct NotificationResult {
    pub success: bool,
    pub notification_id: String,
    pub recipient_count: usize,
    pub delivered_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
    pub processing_time_ms: u64,
}

/// Drives the full pipeline for one domain event: compose, resolve
/// recipients, dispatch, queue failures for retry, log the activity.
pub struct NotificationService {
    state: Arc<AppState>,
}

impl NotificationService {
    pub fn new(state: &Arc<AppState>) -> Self {
        NotificationService {
            state: state.clone(),
        }
    }

    pub async fn send_event(
        &self,
        client_id: &str,
        project_id: Option<&str>,
        event: &DomainEvent,
        options: SendOptions,
    ) -> NotificationResult {
        let started = std::time::Instant::now();
        let notification_id = Uuid::new_v4().to_string();

        let content = compose(event);

        let resolution = self
            .state
            .resolver
            .resolve(client_id, project_id, false)
            .await;

        let mut errors = resolution.errors;
        let user_ids: Vec<String> = resolution
            .recipients
            .iter()
            .map(|r| r.user_id.clone())
            .collect();
        let recipient_count = user_ids.len();

        if user_ids.is_empty() {
            errors.push("no recipients resolved for notification".to_string());
            tracing::warn!(
                "Notification {} for client {} resolved zero recipients",
                notification_id,
                client_id
            );
            return NotificationResult {
                success: false,
                notification_id,
                recipient_count: 0,
                delivered_count: 0,
                failed_count: 0,
                errors,
                processing_time_ms: started.elapsed().as_millis() as u64,
            };
        }

        // An open circuit short-circuits the send entirely; the batch goes
        // straight to the retry queue.
        if self
            .state
            .retry
            .breaker_is_open(PUSH_GATEWAY_DESTINATION)
            .await
        {
            errors.push("push gateway circuit open, delivery deferred".to_string());
            self.state
                .retry
                .enqueue(
                    &notification_id,
                    user_ids.clone(),
                    &content,
                    &options,
                    errors.last().cloned(),
                )
                .await;

            return NotificationResult {
                success: false,
                notification_id,
                recipient_count,
                delivered_count: 0,
                failed_count: recipient_count,
                errors,
                processing_time_ms: started.elapsed().as_millis() as u64,
            };
        }

        let outcome = self
            .state
            .dispatcher
            .send_to_users(&user_ids, &content, &options)
            .await;

        if outcome.success {
            self.state.retry.record_success(PUSH_GATEWAY_DESTINATION).await;
        } else {
            self.state.retry.record_failure(PUSH_GATEWAY_DESTINATION).await;
        }

        if !outcome.failed_user_ids.is_empty() {
            self.state
                .retry
                .enqueue(
                    &notification_id,
                    outcome.failed_user_ids.clone(),
                    &content,
                    &options,
                    outcome.errors.first().cloned(),
                )
                .await;
        }

        let failed_count = outcome.errors.len();
        errors.extend(outcome.errors);

        self.state.activity_log.log(serde_json::json!({
            "type": "notification_sent",
            "notification_id": notification_id,
            "client_id": client_id,
            "project_id": project_id,
            "title": content.title,
            "recipient_count": recipient_count,
            "delivered_count": outcome.messages_sent,
            "failed_count": failed_count,
            "at": Utc::now().to_rfc3339(),
        }));

        NotificationResult {
            success: outcome.success,
            notification_id,
            recipient_count,
            delivered_count: outcome.messages_sent,
            failed_count,
            errors,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}
