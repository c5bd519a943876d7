//! Account repository.

use crate::error::RegistryResult;
use crate::models::AccountRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for account operations.
///
/// Accounts are upserted lazily by any operation that names them.
#[async_trait]
pub trait AccountRepo: Send + Sync {
    /// Insert the account or overwrite its namespace.
    async fn upsert_account(&self, id: Uuid, namespace: &str) -> RegistryResult<()>;

    /// Get an account by id.
    async fn get_account(&self, id: Uuid) -> RegistryResult<Option<AccountRow>>;
}
