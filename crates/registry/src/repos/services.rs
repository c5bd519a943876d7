//! Service repository.

use crate::error::RegistryResult;
use crate::models::ServiceRow;
use async_trait::async_trait;
use uuid::Uuid;

/// A service registration to persist.
#[derive(Debug, Clone)]
pub struct NewService {
    pub service_id: Uuid,
    /// Hub instance the service is exported through.
    pub hub_id: Uuid,
    pub account_id: Uuid,
    pub account_namespace: String,
    pub service_type: String,
    /// Labels in canonical `name=value` form.
    pub labels: Vec<String>,
}

/// Repository for service records.
#[async_trait]
pub trait ServiceRepo: Send + Sync {
    /// Insert a service, upserting its account row in the same
    /// transaction.
    async fn add_service(&self, service: &NewService) -> RegistryResult<ServiceRow>;

    /// Delete rows matching the service id. Returns the number removed.
    async fn remove_service(&self, service_id: Uuid) -> RegistryResult<u64>;

    /// Delete all services of a hub instance. Returns the distinct
    /// accounts affected so callers can re-materialize routing.
    async fn remove_hub_services(&self, instance_id: Uuid) -> RegistryResult<Vec<Uuid>>;

    /// All services of an account, in registration order.
    async fn services_for_account(&self, account_id: Uuid) -> RegistryResult<Vec<ServiceRow>>;
}
