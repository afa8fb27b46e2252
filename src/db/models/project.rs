use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub client_id: String,
    pub name: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Denormalized staff assignment subrecord copied onto a project when staff
/// is assigned. Carries no email address.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProjectStaff {
    pub id: String,
    pub project_id: String,
    pub staff_id: String,
    pub full_name: String,
    pub role: Option<String>,
    pub assigned_at: NaiveDateTime,
}
