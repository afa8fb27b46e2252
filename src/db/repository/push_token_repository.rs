use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{PushToken, RegisterPushToken};
use crate::error::{AppError, AppResult};

/// Repository for device push tokens.
///
/// Registration enforces the one-active-token-per-(user, device) invariant by
/// deactivating prior tokens for the same device before upserting the new
/// one. Deactivations append a timestamped entry to the row's audit trail
/// instead of deleting it; hard deletes happen only in maintenance cleanup.
pub struct PushTokenRepository;

fn audit_entry(reason: &str) -> String {
    format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), reason)
}

impl PushTokenRepository {
    /// Register a new token or refresh an existing one.
    ///
    /// When the payload carries a `device_id`, any other active token for the
    /// same (user, device) pair is deactivated first so the invariant of at
    /// most one active token per physical device holds.
    pub async fn register(pool: &SqlitePool, reg: RegisterPushToken) -> AppResult<PushToken> {
        let now = Utc::now().naive_utc();

        if let Some(ref device_id) = reg.device_id {
            sqlx::query(
                r#"
                UPDATE push_tokens
                SET is_active = 0,
                    audit_trail = audit_trail || ?,
                    updated_at = ?
                WHERE user_id = ? AND device_id = ? AND token != ? AND is_active = 1
                "#,
            )
            .bind(audit_entry("superseded by new registration"))
            .bind(now)
            .bind(&reg.user_id)
            .bind(device_id)
            .bind(&reg.token)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        }

        let id = Uuid::new_v4().to_string();

        let row = sqlx::query_as::<_, PushToken>(
            r#"
            INSERT INTO push_tokens (
                id, user_id, user_type, token, platform,
                device_id, device_name, app_version,
                is_active, health_score, audit_trail,
                last_used, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, NULL, '', ?, ?, ?)
            ON CONFLICT(token) DO UPDATE SET
                user_id = excluded.user_id,
                user_type = excluded.user_type,
                platform = excluded.platform,
                device_id = excluded.device_id,
                device_name = excluded.device_name,
                app_version = excluded.app_version,
                is_active = 1,
                last_used = excluded.last_used,
                updated_at = excluded.updated_at
            RETURNING
                id, user_id, user_type, token, platform,
                device_id, device_name, app_version,
                is_active, health_score, audit_trail,
                last_used, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&reg.user_id)
        .bind(&reg.user_type)
        .bind(&reg.token)
        .bind(&reg.platform)
        .bind(&reg.device_id)
        .bind(&reg.device_name)
        .bind(&reg.app_version)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Fetch all token records for a set of user ids (active and inactive).
    pub async fn find_by_user_ids(
        pool: &SqlitePool,
        user_ids: &[String],
    ) -> AppResult<Vec<PushToken>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            r#"
            SELECT id, user_id, user_type, token, platform,
                   device_id, device_name, app_version,
                   is_active, health_score, audit_trail,
                   last_used, created_at, updated_at
            FROM push_tokens
            WHERE user_id IN (
            "#,
        );
        let mut separated = qb.separated(", ");
        for user_id in user_ids {
            separated.push_bind(user_id);
        }
        qb.push(")");

        qb.build_query_as::<PushToken>()
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_user_id(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<PushToken>> {
        sqlx::query_as::<_, PushToken>(
            r#"
            SELECT id, user_id, user_type, token, platform,
                   device_id, device_name, app_version,
                   is_active, health_score, audit_trail,
                   last_used, created_at, updated_at
            FROM push_tokens
            WHERE user_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Deactivate a token by its raw value and record the reason in the audit
    /// trail. Returns the number of rows affected.
    pub async fn mark_invalid(pool: &SqlitePool, token: &str, reason: &str) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let res = sqlx::query(
            r#"
            UPDATE push_tokens
            SET is_active = 0,
                audit_trail = audit_trail || ?,
                updated_at = ?
            WHERE token = ? AND is_active = 1
            "#,
        )
        .bind(audit_entry(reason))
        .bind(now)
        .bind(token)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected())
    }

    pub async fn deactivate_by_id(pool: &SqlitePool, id: &str, reason: &str) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let res = sqlx::query(
            r#"
            UPDATE push_tokens
            SET is_active = 0,
                audit_trail = audit_trail || ?,
                updated_at = ?
            WHERE id = ? AND is_active = 1
            "#,
        )
        .bind(audit_entry(reason))
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected())
    }

    pub async fn deactivate_by_user(
        pool: &SqlitePool,
        user_id: &str,
        reason: &str,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let res = sqlx::query(
            r#"
            UPDATE push_tokens
            SET is_active = 0,
                audit_trail = audit_trail || ?,
                updated_at = ?
            WHERE user_id = ? AND is_active = 1
            "#,
        )
        .bind(audit_entry(reason))
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected())
    }

    /// Refresh `last_used` for a set of token values after a confirmed send.
    pub async fn touch_last_used(pool: &SqlitePool, tokens: &[String]) -> AppResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("UPDATE push_tokens SET last_used = ");
        qb.push_bind(now);
        qb.push(", updated_at = ");
        qb.push_bind(now);
        qb.push(" WHERE token IN (");
        let mut separated = qb.separated(", ");
        for token in tokens {
            separated.push_bind(token);
        }
        qb.push(")");

        qb.build().execute(pool).await.map_err(AppError::Database)?;
        Ok(())
    }

    /// Deactivate active tokens whose `last_used` is older than `cutoff`.
    pub async fn deactivate_unused_since(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
        reason: &str,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let res = sqlx::query(
            r#"
            UPDATE push_tokens
            SET is_active = 0,
                audit_trail = audit_trail || ?,
                updated_at = ?
            WHERE is_active = 1 AND last_used < ?
            "#,
        )
        .bind(audit_entry(reason))
        .bind(now)
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected())
    }

    /// Hard-delete tokens that have been inactive since before `cutoff`.
    pub async fn delete_inactive_before(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
    ) -> AppResult<u64> {
        let res = sqlx::query(
            "DELETE FROM push_tokens WHERE is_active = 0 AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected())
    }

    pub async fn list_active(pool: &SqlitePool) -> AppResult<Vec<PushToken>> {
        sqlx::query_as::<_, PushToken>(
            r#"
            SELECT id, user_id, user_type, token, platform,
                   device_id, device_name, app_version,
                   is_active, health_score, audit_trail,
                   last_used, created_at, updated_at
            FROM push_tokens
            WHERE is_active = 1
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn update_health_score(pool: &SqlitePool, id: &str, score: i64) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query("UPDATE push_tokens SET health_score = ?, updated_at = ? WHERE id = ?")
            .bind(score)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn count_active_by_platform(pool: &SqlitePool) -> AppResult<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT platform, COUNT(*) FROM push_tokens WHERE is_active = 1 GROUP BY platform",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn count_active_by_user_type(pool: &SqlitePool) -> AppResult<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT user_type, COUNT(*) FROM push_tokens WHERE is_active = 1 GROUP BY user_type",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Number of active tokens used since `cutoff`; the recent-usage trend
    /// input for maintenance analytics.
    pub async fn count_used_since(pool: &SqlitePool, cutoff: NaiveDateTime) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM push_tokens WHERE is_active = 1 AND last_used >= ?",
        )
        .bind(cutoff)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }
}
