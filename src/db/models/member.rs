use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Tenant administrator account.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Admin {
    pub id: String,
    pub client_id: String,
    pub full_name: String,
    pub email: String,
    pub role: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Staff account. Client membership is kept in the `staff_clients`
/// many-to-many table, not on this row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Staff {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub role: Option<String>,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
