use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::models::{PushToken, RegisterPushToken};
use crate::db::PushTokenRepository;
use crate::error::{AppError, AppErrorWithDetails, AppResult};
use crate::routes::auth::AuthUser;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/",
        post(register_token).get(list_tokens).delete(delete_tokens),
    )
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    pub user_id: String,
    pub token: String,
    pub platform: String,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub app_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTokensQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteTokensQuery {
    pub token_id: Option<String>,
    pub token: Option<String>,
    pub user_id: Option<String>,
}

/// Token summary with the raw token value withheld.
#[derive(Debug, Serialize)]
pub struct TokenSummary {
    pub id: String,
    pub user_id: String,
    pub user_type: String,
    pub token_preview: String,
    pub platform: String,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub app_version: Option<String>,
    pub is_active: bool,
    pub health_score: Option<i64>,
    pub last_used: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct RegisterTokenResponse {
    pub success: bool,
    pub token: TokenSummary,
}

#[derive(Debug, Serialize)]
pub struct ListTokensResponse {
    pub success: bool,
    pub tokens: Vec<TokenSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeleteTokensResponse {
    pub success: bool,
    pub deactivated: u64,
}

// ============================================================================
// Input hygiene
// ============================================================================

const SUPPORTED_PLATFORMS: [&str; 3] = ["ios", "android", "web"];

/// Reject values carrying script, SQL or path-traversal payloads. Applied to
/// free-text registration fields; the token itself is covered by the stricter
/// token validator.
fn injection_pattern(value: &str) -> Option<&'static str> {
    let lowered = value.to_lowercase();

    const PATTERNS: [(&str, &str); 10] = [
        ("<script", "script tag"),
        ("javascript:", "script URI"),
        ("onerror=", "event handler"),
        ("' or ", "sql injection"),
        ("\" or ", "sql injection"),
        ("union select", "sql injection"),
        ("drop table", "sql injection"),
        ("--", "sql comment"),
        ("../", "path traversal"),
        ("..\\", "path traversal"),
    ];

    PATTERNS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, label)| *label)
}

fn sanitize_field(name: &str, value: &str) -> AppResult<()> {
    if let Some(label) = injection_pattern(value) {
        return Err(AppError::Validation(format!(
            "{} contains a disallowed pattern ({})",
            name, label
        )));
    }
    Ok(())
}

fn mask_token(token: &str) -> String {
    if token.len() > 20 {
        format!("{}...{}", &token[..12], &token[token.len() - 4..])
    } else {
        "***".to_string()
    }
}

fn summarize(token: PushToken) -> TokenSummary {
    TokenSummary {
        token_preview: mask_token(&token.token),
        id: token.id,
        user_id: token.user_id,
        user_type: token.user_type,
        platform: token.platform,
        device_id: token.device_id,
        device_name: token.device_name,
        app_version: token.app_version,
        is_active: token.is_active,
        health_score: token.health_score,
        last_used: token.last_used,
        created_at: token.created_at,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Register or refresh a device push token. The bearer account must be the
/// registering user; prior tokens for the same device are deactivated.
async fn register_token(
    State(state): State<Arc<AppState>>,
    AuthUser(account): AuthUser,
    Json(request): Json<RegisterTokenRequest>,
) -> Result<Json<RegisterTokenResponse>, AppErrorWithDetails> {
    if request.user_id != account.id {
        tracing::warn!(
            "Account {} attempted to register a token for user {}",
            account.id,
            request.user_id
        );
        return Err(AppError::Forbidden.into());
    }

    sanitize_field("user_id", &request.user_id)?;
    if let Some(ref device_id) = request.device_id {
        sanitize_field("device_id", device_id)?;
    }
    if let Some(ref device_name) = request.device_name {
        sanitize_field("device_name", device_name)?;
    }
    if let Some(ref app_version) = request.app_version {
        sanitize_field("app_version", app_version)?;
    }

    if !SUPPORTED_PLATFORMS.contains(&request.platform.as_str()) {
        return Err(AppError::Validation(format!(
            "unsupported platform {:?}, expected one of ios, android, web",
            request.platform
        ))
        .into());
    }

    let validation = state.validator.validate(&request.token);
    if !validation.is_valid {
        return Err(AppError::TokenValidation("push token failed validation".to_string())
            .with_details(serde_json::json!({ "errors": validation.errors })));
    }

    let registered = PushTokenRepository::register(
        &state.db,
        RegisterPushToken {
            user_id: request.user_id,
            user_type: account.user_type.clone(),
            token: request.token,
            platform: request.platform,
            device_id: request.device_id,
            device_name: request.device_name,
            app_version: request.app_version,
        },
    )
    .await?;

    tracing::info!(
        "Registered {} push token for {} {} on {}",
        validation
            .format
            .map(|f| f.as_str())
            .unwrap_or("unknown"),
        account.user_type,
        account.id,
        registered.platform
    );

    Ok(Json(RegisterTokenResponse {
        success: true,
        token: summarize(registered),
    }))
}

/// List a user's registered tokens, raw values withheld. Staff may only list
/// their own; admins may list anyone's.
async fn list_tokens(
    State(state): State<Arc<AppState>>,
    AuthUser(account): AuthUser,
    Query(query): Query<ListTokensQuery>,
) -> AppResult<Json<ListTokensResponse>> {
    let user_id = query.user_id.unwrap_or_else(|| account.id.clone());

    if user_id != account.id && !account.is_admin() {
        return Err(AppError::Forbidden);
    }

    let tokens = PushTokenRepository::find_by_user_id(&state.db, &user_id).await?;

    Ok(Json(ListTokensResponse {
        success: true,
        tokens: tokens.into_iter().map(summarize).collect(),
    }))
}

/// Deactivate tokens by token id, raw token value, or owning user.
async fn delete_tokens(
    State(state): State<Arc<AppState>>,
    AuthUser(account): AuthUser,
    Query(query): Query<DeleteTokensQuery>,
) -> AppResult<Json<DeleteTokensResponse>> {
    let reason = format!("deactivated via API by {}", account.id);

    let deactivated = if let Some(ref token_id) = query.token_id {
        let owned = PushTokenRepository::find_by_user_id(&state.db, &account.id)
            .await?
            .iter()
            .any(|t| &t.id == token_id);
        if !owned && !account.is_admin() {
            return Err(AppError::Forbidden);
        }
        PushTokenRepository::deactivate_by_id(&state.db, token_id, &reason).await?
    } else if let Some(ref token) = query.token {
        let owned = PushTokenRepository::find_by_user_id(&state.db, &account.id)
            .await?
            .iter()
            .any(|t| &t.token == token);
        if !owned && !account.is_admin() {
            return Err(AppError::Forbidden);
        }
        PushTokenRepository::mark_invalid(&state.db, token, &reason).await?
    } else if let Some(ref user_id) = query.user_id {
        if user_id != &account.id && !account.is_admin() {
            return Err(AppError::Forbidden);
        }
        PushTokenRepository::deactivate_by_user(&state.db, user_id, &reason).await?
    } else {
        return Err(AppError::BadRequest(
            "one of token_id, token or user_id is required".to_string(),
        ));
    };

    Ok(Json(DeleteTokensResponse {
        success: true,
        deactivated,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_patterns_are_rejected() {
        assert!(injection_pattern("<script>alert(1)</script>").is_some());
        assert!(injection_pattern("JAVASCRIPT:void(0)").is_some());
        assert!(injection_pattern("x' OR '1'='1").is_some());
        assert!(injection_pattern("1; DROP TABLE push_tokens; --").is_some());
        assert!(injection_pattern("../../etc/passwd").is_some());
        assert!(injection_pattern("Pixel 8 Pro").is_none());
        assert!(injection_pattern("1.24.3").is_none());
    }

    #[test]
    fn masked_preview_hides_the_middle() {
        let masked = mask_token("ExpoPushToken[abcdefghij1234]");
        assert_eq!(masked, "ExpoPushToke...234]");
        assert!(!masked.contains("abcdefghij"));

        assert_eq!(mask_token("short"), "***");
    }
}
