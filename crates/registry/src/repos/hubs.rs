//! Hub repository.

use crate::error::RegistryResult;
use crate::models::HubRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Outcome of a hub checkin.
#[derive(Debug, Clone)]
pub struct HubCheckin {
    pub hub: HubRow,
    /// The previous instance id, when the checkin rotated the instance.
    pub rotated_instance: Option<Uuid>,
    /// Accounts whose services were dropped by the rotation.
    pub affected_accounts: Vec<Uuid>,
}

/// Repository for hub records.
#[async_trait]
pub trait HubRepo: Send + Sync {
    /// Record a hub checkin, in one transaction:
    /// - no row: insert
    /// - stored instance differs: delete all services of the prior
    ///   instance, then update the row
    /// - otherwise: refresh connection info and last checkin
    async fn checkin_hub(
        &self,
        stable_id: Uuid,
        instance_id: Uuid,
        connection_info: &str,
    ) -> RegistryResult<HubCheckin>;

    /// Snapshot of all known hubs.
    async fn all_hubs(&self) -> RegistryResult<Vec<HubRow>>;

    /// Delete a hub row by stable id.
    async fn delete_hub(&self, stable_id: Uuid) -> RegistryResult<()>;
}
