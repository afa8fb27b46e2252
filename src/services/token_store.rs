use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::PushToken;
use crate::db::PushTokenRepository;
use crate::services::token_validator::TokenValidator;

/// A stored token that failed format validation, with the reasons.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidToken {
    pub user_id: String,
    pub token: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenFetchStats {
    pub requested_users: usize,
    pub records_fetched: usize,
    pub valid: usize,
    pub invalid: usize,
    pub missing_users: usize,
}

/// Result of resolving user ids to sendable device tokens.
#[derive(Debug, Default)]
pub struct ActiveTokens {
    pub tokens: Vec<PushToken>,
    pub invalid_tokens: Vec<InvalidToken>,
    pub missing_users: Vec<String>,
    pub stats: TokenFetchStats,
}

/// Gateway between the pipeline and the push token table.
///
/// Lookups never propagate store failures: on any backing error the caller
/// gets an all-empty result so a notification degrades to "zero delivered"
/// instead of an unhandled error. Cleanup writes are best-effort and only
/// logged on failure.
#[derive(Clone)]
pub struct TokenStore {
    pool: SqlitePool,
    validator: Arc<TokenValidator>,
}

impl TokenStore {
    pub fn new(pool: SqlitePool, validator: Arc<TokenValidator>) -> Self {
        TokenStore { pool, validator }
    }

    /// Fetch all token records for the given users, partition them by
    /// validation outcome and report users that have no records at all.
    ///
    /// Only records with `is_active` set are considered; inactive rows are
    /// skipped silently (they were already dealt with).
    pub async fn active_tokens_for_users(&self, user_ids: &[String]) -> ActiveTokens {
        let mut result = ActiveTokens {
            stats: TokenFetchStats {
                requested_users: user_ids.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        let records = match PushTokenRepository::find_by_user_ids(&self.pool, user_ids).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Token lookup failed for {} users: {:?}", user_ids.len(), e);
                return result;
            }
        };

        result.stats.records_fetched = records.len();

        let mut users_with_records: HashSet<&str> = HashSet::new();

        for record in records {
            if !record.is_active {
                continue;
            }

            let validation = self.validator.validate(&record.token);
            if validation.is_valid {
                result.tokens.push(record);
            } else {
                result.invalid_tokens.push(InvalidToken {
                    user_id: record.user_id,
                    token: record.token,
                    errors: validation.errors,
                });
            }
        }

        for token in &result.tokens {
            users_with_records.insert(token.user_id.as_str());
        }
        for invalid in &result.invalid_tokens {
            users_with_records.insert(invalid.user_id.as_str());
        }

        result.missing_users = user_ids
            .iter()
            .filter(|id| !users_with_records.contains(id.as_str()))
            .cloned()
            .collect();

        result.stats.valid = result.tokens.len();
        result.stats.invalid = result.invalid_tokens.len();
        result.stats.missing_users = result.missing_users.len();

        result
    }

    /// Deactivate a token and append a timestamped reason to its audit
    /// trail. Best-effort: failures are logged, never raised.
    pub async fn mark_token_invalid(&self, token: &str, reason: &str) {
        match PushTokenRepository::mark_invalid(&self.pool, token, reason).await {
            Ok(0) => {
                tracing::debug!("Token already inactive or unknown, skipping invalidation");
            }
            Ok(_) => {
                tracing::info!("Marked push token invalid: {}", reason);
            }
            Err(e) => {
                tracing::warn!("Failed to mark push token invalid: {:?}", e);
            }
        }
    }

    /// Refresh `last_used` for tokens confirmed delivered. Best-effort.
    pub async fn touch_delivered(&self, tokens: &[String]) {
        if let Err(e) = PushTokenRepository::touch_last_used(&self.pool, tokens).await {
            tracing::warn!(
                "Failed to refresh last_used for {} tokens: {:?}",
                tokens.len(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::RegisterPushToken;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }

    async fn register(pool: &SqlitePool, user_id: &str, token: &str) {
        PushTokenRepository::register(
            pool,
            RegisterPushToken {
                user_id: user_id.to_string(),
                user_type: "staff".to_string(),
                token: token.to_string(),
                platform: "android".to_string(),
                device_id: None,
                device_name: None,
                app_version: None,
            },
        )
        .await
        .expect("register token");
    }

    #[tokio::test]
    async fn partitions_users_without_overlap() {
        let pool = test_pool().await;
        let store = TokenStore::new(pool.clone(), Arc::new(TokenValidator::new()));

        register(&pool, "user-valid", "ExpoPushToken[abc123def456]").await;
        register(&pool, "user-invalid", "not-a-real-token-shape!").await;

        let requested = vec![
            "user-valid".to_string(),
            "user-invalid".to_string(),
            "user-missing".to_string(),
        ];
        let result = store.active_tokens_for_users(&requested).await;

        assert_eq!(result.tokens.len(), 1);
        assert_eq!(result.tokens[0].user_id, "user-valid");
        assert_eq!(result.invalid_tokens.len(), 1);
        assert_eq!(result.invalid_tokens[0].user_id, "user-invalid");
        assert_eq!(result.missing_users, vec!["user-missing".to_string()]);

        let mut all: Vec<&str> = result
            .tokens
            .iter()
            .map(|t| t.user_id.as_str())
            .chain(result.invalid_tokens.iter().map(|t| t.user_id.as_str()))
            .chain(result.missing_users.iter().map(|u| u.as_str()))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), requested.len());

        assert_eq!(result.stats.requested_users, 3);
        assert_eq!(result.stats.records_fetched, 2);
        assert_eq!(result.stats.valid, 1);
        assert_eq!(result.stats.invalid, 1);
        assert_eq!(result.stats.missing_users, 1);
    }

    #[tokio::test]
    async fn never_returns_inactive_tokens() {
        let pool = test_pool().await;
        let store = TokenStore::new(pool.clone(), Arc::new(TokenValidator::new()));

        register(&pool, "u1", "ExpoPushToken[active123456]").await;
        register(&pool, "u1", "ExpoPushToken[retired12345]").await;
        store
            .mark_token_invalid("ExpoPushToken[retired12345]", "device unregistered")
            .await;

        let result = store
            .active_tokens_for_users(&["u1".to_string()])
            .await;

        assert!(result.tokens.iter().all(|t| t.is_active));
        assert_eq!(result.tokens.len(), 1);
        assert_eq!(result.tokens[0].token, "ExpoPushToken[active123456]");
    }

    #[tokio::test]
    async fn mark_invalid_appends_audit_trail() {
        let pool = test_pool().await;
        let store = TokenStore::new(pool.clone(), Arc::new(TokenValidator::new()));

        register(&pool, "u1", "ExpoPushToken[abc123def456]").await;
        store
            .mark_token_invalid("ExpoPushToken[abc123def456]", "gateway reported unregistered")
            .await;

        let tokens = PushTokenRepository::find_by_user_id(&pool, "u1")
            .await
            .unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(!tokens[0].is_active);
        assert!(tokens[0].audit_trail.contains("gateway reported unregistered"));
    }

    #[tokio::test]
    async fn empty_input_yields_empty_result() {
        let pool = test_pool().await;
        let store = TokenStore::new(pool, Arc::new(TokenValidator::new()));

        let result = store.active_tokens_for_users(&[]).await;
        assert!(result.tokens.is_empty());
        assert!(result.invalid_tokens.is_empty());
        assert!(result.missing_users.is_empty());
    }
}
