//! Database models mapping to the registry schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Tenant record. Upsert key is `id`; on conflict the namespace is
/// overwritten.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub namespace: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Management client allocated by Register.
#[derive(Debug, Clone, FromRow)]
pub struct ManagementClientRow {
    pub id: Uuid,
    pub namespace: String,
}

/// Hub record. `stable_id` identifies the logical hub across restarts;
/// `instance_id` changes on every (re)start.
#[derive(Debug, Clone, FromRow)]
pub struct HubRow {
    pub stable_id: Uuid,
    pub instance_id: Uuid,
    /// Serialized list of network locations.
    pub connection_info: String,
    pub last_checkin: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Service record. A service belongs to exactly one hub instance.
#[derive(Debug, Clone, FromRow)]
pub struct ServiceRow {
    pub id: i64,
    pub service_id: Uuid,
    /// Hub *instance* id the service was registered through.
    pub hub_id: Uuid,
    pub account_id: Uuid,
    #[sqlx(rename = "type")]
    pub service_type: String,
    /// Labels in canonical `name=value` form.
    pub labels: Vec<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Label link record. Unique on `(account_id, labels)` where `labels`
/// and `target` are canonically flattened label sets.
#[derive(Debug, Clone, FromRow)]
pub struct LabelLinkRow {
    pub id: i64,
    pub account_id: Uuid,
    pub labels: String,
    pub target: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
