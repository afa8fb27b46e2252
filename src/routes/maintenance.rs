use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::services::maintenance::{JobKind, JobReport, MaintenanceStatus};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(maintenance_status).post(trigger_job))
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(default = "default_job")]
    pub job: JobKind,
}

fn default_job() -> JobKind {
    JobKind::Full
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub report: JobReport,
}

/// The cron trigger authenticates with a shared secret, not a user JWT.
/// Compare digests so the check does not leak length or prefix timing.
fn verify_cron_secret(headers: &HeaderMap, expected: &str) -> AppResult<()> {
    let provided = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AppError::Unauthorized)?;

    if expected.is_empty() {
        tracing::error!("MAINTENANCE_CRON_SECRET is not configured");
        return Err(AppError::Config("maintenance secret unset".to_string()));
    }

    let provided_digest = hex::encode(Sha256::digest(provided.as_bytes()));
    let expected_digest = hex::encode(Sha256::digest(expected.as_bytes()));
    if provided_digest != expected_digest {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

/// Cron-triggered maintenance run. Answers 503 while a run is already in
/// flight.
async fn trigger_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TriggerRequest>,
) -> AppResult<Json<TriggerResponse>> {
    verify_cron_secret(&headers, &state.config.maintenance.cron_secret)?;

    tracing::info!("Maintenance job {:?} triggered via endpoint", request.job);
    let report = state.maintenance.run(request.job).await?;

    Ok(Json(TriggerResponse {
        success: true,
        report,
    }))
}

/// Current schedule, run state and bounded job history.
async fn maintenance_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<MaintenanceStatus>> {
    verify_cron_secret(&headers, &state.config.maintenance.cron_secret)?;
    Ok(Json(state.maintenance.status().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn accepts_matching_secret() {
        assert!(verify_cron_secret(&headers_with("cron-secret"), "cron-secret").is_ok());
    }

    #[test]
    fn rejects_wrong_or_missing_secret() {
        assert!(verify_cron_secret(&headers_with("wrong"), "cron-secret").is_err());
        assert!(verify_cron_secret(&HeaderMap::new(), "cron-secret").is_err());
        assert!(verify_cron_secret(&headers_with("anything"), "").is_err());
    }
}
