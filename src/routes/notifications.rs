use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

use crate::db::ProjectRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::composer::DomainEvent;
use crate::services::dispatcher::SendOptions;
use crate::services::notifications::{NotificationResult, NotificationService};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/send", post(send_notification))
}

#[derive(Debug, Deserialize)]
pub struct SendNotificationRequest {
    pub client_id: String,
    pub project_id: Option<String>,
    pub event: DomainEvent,
    #[serde(default)]
    pub options: Option<SendOptions>,
}

/// Run the full pipeline for one domain event: compose, resolve recipients,
/// dispatch, queue failed deliveries for retry. Always answers 200 with the
/// result envelope unless the caller input itself is malformed.
async fn send_notification(
    State(state): State<Arc<AppState>>,
    AuthUser(account): AuthUser,
    Json(request): Json<SendNotificationRequest>,
) -> AppResult<Json<NotificationResult>> {
    if request.client_id.is_empty() {
        return Err(AppError::BadRequest("client_id is required".to_string()));
    }

    // Admins are scoped to their own tenant.
    if let Some(ref own_client) = account.client_id {
        if own_client != &request.client_id {
            tracing::warn!(
                "Admin {} attempted to notify client {}",
                account.id,
                request.client_id
            );
            return Err(AppError::Forbidden);
        }
    }

    // A supplied project must exist and belong to the tenant.
    if let Some(ref project_id) = request.project_id {
        let project = ProjectRepository::find_by_id(&state.db, project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {} not found", project_id)))?;
        if project.client_id != request.client_id {
            return Err(AppError::BadRequest(format!(
                "project {} does not belong to client {}",
                project_id, request.client_id
            )));
        }
    }

    tracing::info!(
        "Notification send requested by {} ({})",
        account.full_name,
        account.id
    );

    let service = NotificationService::new(&state);
    let result = service
        .send_event(
            &request.client_id,
            request.project_id.as_deref(),
            &request.event,
            request.options.unwrap_or_default(),
        )
        .await;

    Ok(Json(result))
}
