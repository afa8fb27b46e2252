use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::recipients::{Recipient, ResolutionSource};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/",
        get(resolve_recipients)
            .head(cache_size)
            .delete(clear_cache),
    )
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub client_id: Option<String>,
    pub project_id: Option<String>,
    pub skip_cache: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecipientsResponse {
    pub success: bool,
    pub source: ResolutionSource,
    pub recipients: Vec<Recipient>,
    pub errors: Vec<String>,
    pub recipient_count: usize,
    pub deduplication_count: usize,
    pub resolution_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub success: bool,
    pub cleared: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Resolve the notification recipients for a client, optionally scoped to a
/// project. Stage failures come back in `errors` with a 200; only missing
/// input is rejected outright.
async fn resolve_recipients(
    State(state): State<Arc<AppState>>,
    AuthUser(_account): AuthUser,
    Query(query): Query<ResolveQuery>,
) -> AppResult<Json<RecipientsResponse>> {
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("client_id is required".to_string()))?;

    let started = Instant::now();
    let outcome = state
        .resolver
        .resolve(
            &client_id,
            query.project_id.as_deref(),
            query.skip_cache.unwrap_or(false),
        )
        .await;

    let success = !outcome.recipients.is_empty() || outcome.errors.is_empty();

    Ok(Json(RecipientsResponse {
        success,
        source: outcome.source,
        recipient_count: outcome.recipients.len(),
        deduplication_count: outcome.deduplication_count,
        recipients: outcome.recipients,
        errors: outcome.errors,
        resolution_time_ms: started.elapsed().as_millis() as u64,
    }))
}

/// HEAD probe: reports the resolution cache size in a response header.
async fn cache_size(
    State(state): State<Arc<AppState>>,
    AuthUser(_account): AuthUser,
) -> AppResult<impl IntoResponse> {
    let size = state.resolver.cache_size().await;
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-resolution-cache-size",
        size.to_string()
            .parse()
            .map_err(|_| AppError::Internal(anyhow::anyhow!("invalid header value")))?,
    );
    Ok((StatusCode::OK, headers))
}

/// Drop cached resolutions, either for one client or all of them.
async fn clear_cache(
    State(state): State<Arc<AppState>>,
    AuthUser(_account): AuthUser,
    Query(query): Query<ClearQuery>,
) -> AppResult<Json<ClearCacheResponse>> {
    let cleared = state
        .resolver
        .clear_cache(query.client_id.as_deref())
        .await;

    Ok(Json(ClearCacheResponse {
        success: true,
        cleared,
    }))
}
