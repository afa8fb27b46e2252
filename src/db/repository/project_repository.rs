use sqlx::SqlitePool;

use crate::db::models::{Project, ProjectStaff};
use crate::error::{AppError, AppResult};

// ============================================================================
// Project Repository
// ============================================================================

pub struct ProjectRepository;

impl ProjectRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Project>> {
        sqlx::query_as::<_, Project>(
            r#"
            SELECT id, client_id, name, status, created_at, updated_at
            FROM projects
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Denormalized staff assignment subrecords for a project. Used as the
    /// fallback recipient source when the membership lookup fails or is empty.
    pub async fn assigned_staff(pool: &SqlitePool, project_id: &str) -> AppResult<Vec<ProjectStaff>> {
        sqlx::query_as::<_, ProjectStaff>(
            r#"
            SELECT id, project_id, staff_id, full_name, role, assigned_at
            FROM project_staff
            WHERE project_id = ?
            ORDER BY assigned_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
