//! Management client repository.

use crate::error::RegistryResult;
use crate::models::ManagementClientRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for management clients.
#[async_trait]
pub trait ClientRepo: Send + Sync {
    /// Allocate a management client.
    ///
    /// Fails with `AlreadyExists` when the requested namespace is a
    /// prefix of (or equal to) an existing client's namespace.
    async fn create_management_client(&self, id: Uuid, namespace: &str) -> RegistryResult<()>;

    /// Get a management client by id.
    async fn get_management_client(
        &self,
        id: Uuid,
    ) -> RegistryResult<Option<ManagementClientRow>>;
}
