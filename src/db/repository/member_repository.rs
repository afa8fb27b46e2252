use sqlx::SqlitePool;

use crate::db::models::{Admin, Staff};
use crate::error::{AppError, AppResult};

// ============================================================================
// Member Repository (admins + staff)
// ============================================================================

pub struct MemberRepository;

impl MemberRepository {
    /// All admin accounts belonging to a client.
    pub async fn admins_for_client(pool: &SqlitePool, client_id: &str) -> AppResult<Vec<Admin>> {
        sqlx::query_as::<_, Admin>(
            r#"
            SELECT id, client_id, full_name, email, role, is_active, created_at, updated_at
            FROM admins
            WHERE client_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(client_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// All staff accounts that are members of a client, resolved through the
    /// `staff_clients` many-to-many relation.
    pub async fn staff_for_client(pool: &SqlitePool, client_id: &str) -> AppResult<Vec<Staff>> {
        sqlx::query_as::<_, Staff>(
            r#"
            SELECT s.id, s.full_name, s.email, s.role, s.is_active, s.created_at, s.updated_at
            FROM staff s
            INNER JOIN staff_clients sc ON sc.staff_id = s.id
            WHERE sc.client_id = ?
            ORDER BY s.created_at ASC
            "#,
        )
        .bind(client_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_admin_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Admin>> {
        sqlx::query_as::<_, Admin>(
            r#"
            SELECT id, client_id, full_name, email, role, is_active, created_at, updated_at
            FROM admins
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_staff_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Staff>> {
        sqlx::query_as::<_, Staff>(
            r#"
            SELECT id, full_name, email, role, is_active, created_at, updated_at
            FROM staff
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }
}
