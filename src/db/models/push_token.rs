use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Device push token registered by a mobile or web client.
///
/// At most one active token exists per (user_id, device_id) pair; a new
/// registration for the same device deactivates prior tokens. Tokens are
/// never hard-deleted except by maintenance cleanup after a long inactivity
/// window.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PushToken {
    /// Primary key (UUID)
    pub id: String,

    /// Owning user id (admin or staff account)
    pub user_id: String,

    /// Account kind: 'admin' or 'staff'
    pub user_type: String,

    /// The opaque provider token (unique)
    pub token: String,

    /// Device platform: 'ios', 'android' or 'web'
    pub platform: String,

    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub app_version: Option<String>,

    pub is_active: bool,

    /// Last computed validation health score (0-100), refreshed by the
    /// maintenance job.
    pub health_score: Option<i64>,

    /// Newline-separated timestamped entries appended on deactivation and
    /// maintenance actions.
    pub audit_trail: String,

    pub last_used: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to register (or refresh) a push token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPushToken {
    pub user_id: String,
    pub user_type: String,
    pub token: String,
    pub platform: String,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub app_version: Option<String>,
}
