use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::db::MemberRepository;
use crate::error::AppError;
use crate::AppState;

/// Bearer token claims issued by the main management backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id (admin or staff).
    pub sub: String,
    /// Account kind: 'admin' or 'staff'.
    pub user_type: String,
    pub iat: usize,
    pub exp: usize,
}

/// The authenticated account behind a request.
#[derive(Debug, Clone)]
pub struct AuthAccount {
    pub id: String,
    pub user_type: String,
    /// Present for admins; staff may belong to several clients.
    pub client_id: Option<String>,
    pub full_name: String,
}

impl AuthAccount {
    pub fn is_admin(&self) -> bool {
        self.user_type == "admin"
    }
}

/// Extractor for authenticated requests.
pub struct AuthUser(pub AuthAccount);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // Extract Authorization header (Bearer token)
        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("Missing or invalid Authorization header");
                AppError::Unauthorized
            })?;

        if !auth_header.to_ascii_lowercase().starts_with("bearer ") {
            tracing::debug!("Authorization header doesn't start with 'Bearer '");
            return Err(AppError::Unauthorized);
        }

        let token = auth_header[7..].trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt.secret.as_bytes()),
            &Validation::default(),
        )?;
        let claims = token_data.claims;

        let account = match claims.user_type.as_str() {
            "admin" => MemberRepository::find_admin_by_id(&state.db, &claims.sub)
                .await?
                .filter(|admin| admin.is_active)
                .map(|admin| AuthAccount {
                    id: admin.id,
                    user_type: "admin".to_string(),
                    client_id: Some(admin.client_id),
                    full_name: admin.full_name,
                }),
            "staff" => MemberRepository::find_staff_by_id(&state.db, &claims.sub)
                .await?
                .filter(|staff| staff.is_active)
                .map(|staff| AuthAccount {
                    id: staff.id,
                    user_type: "staff".to_string(),
                    client_id: None,
                    full_name: staff.full_name,
                }),
            other => {
                tracing::debug!("Unknown user_type in token claims: {}", other);
                None
            }
        };

        let account = account.ok_or_else(|| {
            tracing::debug!("Token subject {} not found or inactive", claims.sub);
            AppError::Unauthorized
        })?;

        tracing::debug!("Authenticated {} {}", account.user_type, account.id);
        Ok(AuthUser(account))
    }
}

/// Extractor that additionally requires the admin role.
pub struct AdminUser(pub AuthAccount);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(account) = AuthUser::from_request_parts(parts, state).await?;
        if !account.is_admin() {
            return Err(AppError::Forbidden);
        }
        Ok(AdminUser(account))
    }
}
