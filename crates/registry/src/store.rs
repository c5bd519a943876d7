//! Combined registry store contract.

use crate::error::RegistryResult;
use crate::repos::{AccountRepo, ClientRepo, HubRepo, LabelLinkRepo, ServiceRepo};
use async_trait::async_trait;
use uuid::Uuid;

/// The full registry store contract.
///
/// Every externally visible mutation commits atomically before any
/// broadcast is derived from it, so observers can never see a delta that
/// refers to state not yet visible.
#[async_trait]
pub trait RegistryStore:
    AccountRepo + ClientRepo + HubRepo + ServiceRepo + LabelLinkRepo + Send + Sync
{
    /// Run schema setup.
    async fn migrate(&self) -> RegistryResult<()>;

    /// Check store connectivity.
    async fn health_check(&self) -> RegistryResult<()>;

    /// Re-materialize the account's routes and emit one activity entry
    /// on the change feed. Called after the owning mutation committed;
    /// replicas converge by tailing the feed.
    async fn update_account_routing(&self, account_id: Uuid) -> RegistryResult<()>;
}
