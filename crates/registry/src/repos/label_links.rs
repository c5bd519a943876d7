//! Label link repository.
//!
//! `resolve_label_link` and `match_services` are the label-resolution
//! and service-matching interfaces the web frontend consumes.

use crate::error::RegistryResult;
use crate::models::ServiceRow;
use async_trait::async_trait;
use trellis_core::LabelSet;
use uuid::Uuid;

/// Repository for label links.
#[async_trait]
pub trait LabelLinkRepo: Send + Sync {
    /// Insert a link by canonical labels. Fails with `AlreadyExists`
    /// when `(account_id, labels)` is already linked.
    async fn add_label_link(
        &self,
        account_id: Uuid,
        labels: &str,
        target: &str,
    ) -> RegistryResult<()>;

    /// Delete a link by canonical labels. Returns the number removed.
    async fn remove_label_link(&self, account_id: Uuid, labels: &str) -> RegistryResult<u64>;

    /// Look up a link by its canonical labels, across accounts. Returns
    /// the owning account and the canonical target labels.
    async fn resolve_label_link(&self, labels: &str) -> RegistryResult<Option<(Uuid, String)>>;

    /// Services of an account whose label set contains every target
    /// label.
    async fn match_services(
        &self,
        account_id: Uuid,
        target: &LabelSet,
    ) -> RegistryResult<Vec<ServiceRow>>;
}
