use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::routes::auth::AdminUser;
use crate::services::retry::{
    BreakerStatus, FailedNotification, ProcessSummary, RetrySettings, RetrySettingsUpdate,
};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/",
        get(retry_status)
            .post(retry_action)
            .put(update_settings)
            .delete(clear_retries),
    )
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub notification_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    ProcessQueue,
    ForceRetry,
    ClearRetries,
    ClearAll,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: RetryAction,
    pub notification_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RetryStatusResponse {
    pub success: bool,
    pub queue_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<FailedNotification>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<FailedNotification>,
    pub breakers: Vec<BreakerStatus>,
    pub settings: RetrySettings,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ProcessSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub success: bool,
    pub settings: RetrySettings,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub success: bool,
    pub cleared: usize,
}

// ============================================================================
// Handlers (operator controls, admin only)
// ============================================================================

/// Retry queue status: the whole queue, or one notification when
/// `notification_id` is given.
async fn retry_status(
    State(state): State<Arc<AppState>>,
    AdminUser(_account): AdminUser,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<RetryStatusResponse>> {
    let queue_size = state.retry.queue_size().await;
    let breakers = state.retry.breaker_status().await;
    let settings = state.retry.settings().await;

    match query.notification_id {
        Some(id) => {
            let item = state.retry.get(&id).await.ok_or_else(|| {
                AppError::NotFound(format!("no queued retries for notification {}", id))
            })?;
            Ok(Json(RetryStatusResponse {
                success: true,
                queue_size,
                item: Some(item),
                items: Vec::new(),
                breakers,
                settings,
            }))
        }
        None => Ok(Json(RetryStatusResponse {
            success: true,
            queue_size,
            item: None,
            items: state.retry.list().await,
            breakers,
            settings,
        })),
    }
}

async fn retry_action(
    State(state): State<Arc<AppState>>,
    AdminUser(account): AdminUser,
    Json(request): Json<ActionRequest>,
) -> AppResult<Json<ActionResponse>> {
    match request.action {
        RetryAction::ProcessQueue => {
            tracing::info!("Operator {} forced a retry queue pass", account.id);
            let summary = state.retry.process_due(&state.dispatcher).await;
            Ok(Json(ActionResponse {
                success: true,
                action: "process_queue".to_string(),
                summary: Some(summary),
                cleared: None,
            }))
        }
        RetryAction::ForceRetry => {
            let id = request.notification_id.ok_or_else(|| {
                AppError::BadRequest("notification_id is required for force_retry".to_string())
            })?;
            if !state.retry.force_retry(&id).await {
                return Err(AppError::NotFound(format!(
                    "no queued retries for notification {}",
                    id
                )));
            }
            let summary = state.retry.process_due(&state.dispatcher).await;
            Ok(Json(ActionResponse {
                success: true,
                action: "force_retry".to_string(),
                summary: Some(summary),
                cleared: None,
            }))
        }
        RetryAction::ClearRetries => {
            let id = request.notification_id.ok_or_else(|| {
                AppError::BadRequest("notification_id is required for clear_retries".to_string())
            })?;
            let cleared = state.retry.clear(Some(&id)).await;
            Ok(Json(ActionResponse {
                success: true,
                action: "clear_retries".to_string(),
                summary: None,
                cleared: Some(cleared),
            }))
        }
        RetryAction::ClearAll => {
            let cleared = state.retry.clear(None).await;
            tracing::info!("Operator {} cleared the retry queue ({})", account.id, cleared);
            Ok(Json(ActionResponse {
                success: true,
                action: "clear_all".to_string(),
                summary: None,
                cleared: Some(cleared),
            }))
        }
    }
}

/// Update backoff / circuit breaker configuration at runtime.
async fn update_settings(
    State(state): State<Arc<AppState>>,
    AdminUser(account): AdminUser,
    Json(update): Json<RetrySettingsUpdate>,
) -> AppResult<Json<SettingsResponse>> {
    let settings = state.retry.update_settings(update).await;
    tracing::info!("Operator {} updated retry settings", account.id);

    Ok(Json(SettingsResponse {
        success: true,
        settings,
    }))
}

async fn clear_retries(
    State(state): State<Arc<AppState>>,
    AdminUser(_account): AdminUser,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<ClearResponse>> {
    let cleared = state.retry.clear(query.notification_id.as_deref()).await;
    Ok(Json(ClearResponse {
        success: true,
        cleared,
    }))
}
