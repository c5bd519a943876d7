//! In-memory registry store.
//!
//! One realization of the [`RegistryStore`] contract that keeps
//! everything in process and feeds activity entries onto an in-memory
//! bus instead of a database channel. Backs the control-plane
//! integration tests; also handy for single-process experiments.

use crate::activity::{RouteAdded, RouteService};
use crate::error::{RegistryError, RegistryResult};
use crate::models::*;
use crate::repos::{
    AccountRepo, ClientRepo, HubCheckin, HubRepo, LabelLinkRepo, NewService, ServiceRepo,
};
use crate::store::RegistryStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use trellis_core::LabelSet;
use uuid::Uuid;

#[derive(Default)]
struct MemState {
    accounts: HashMap<Uuid, AccountRow>,
    clients: Vec<ManagementClientRow>,
    hubs: HashMap<Uuid, HubRow>,
    services: Vec<ServiceRow>,
    next_service_id: i64,
    links: Vec<LabelLinkRow>,
    next_link_id: i64,
}

/// In-memory registry store.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemState>,
    activity: Mutex<Vec<mpsc::Sender<RouteAdded>>>,
    fail_ops: Mutex<HashSet<&'static str>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the in-memory activity bus.
    pub fn subscribe_activity(&self) -> mpsc::Receiver<RouteAdded> {
        let (tx, rx) = mpsc::channel(64);
        self.activity.lock().push(tx);
        rx
    }

    /// Make the next call to the named operation fail. Fault injection
    /// for tests exercising partial-failure paths.
    pub fn fail_next(&self, op: &'static str) {
        self.fail_ops.lock().insert(op);
    }

    fn check_fault(&self, op: &'static str) -> RegistryResult<()> {
        if self.fail_ops.lock().remove(op) {
            return Err(RegistryError::Internal(format!("injected failure: {op}")));
        }
        Ok(())
    }

    fn publish(&self, entry: RouteAdded) {
        let mut subscribers = self.activity.lock();
        subscribers.retain(|tx| tx.try_send(entry.clone()).is_ok());
    }

    /// Number of service rows currently stored.
    pub fn service_count(&self) -> usize {
        self.state.lock().services.len()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn migrate(&self) -> RegistryResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> RegistryResult<()> {
        Ok(())
    }

    async fn update_account_routing(&self, account_id: Uuid) -> RegistryResult<()> {
        let entry = {
            let state = self.state.lock();
            let account = state
                .accounts
                .get(&account_id)
                .ok_or_else(|| RegistryError::NotFound(format!("account {account_id}")))?;
            RouteAdded {
                account_id,
                namespace: account.namespace.clone(),
                services: state
                    .services
                    .iter()
                    .filter(|s| s.account_id == account_id)
                    .map(|s| RouteService {
                        hub_id: s.hub_id,
                        service_id: s.service_id,
                        service_type: s.service_type.clone(),
                        labels: s.labels.clone(),
                    })
                    .collect(),
            }
        };
        self.publish(entry);
        Ok(())
    }
}

#[async_trait]
impl AccountRepo for MemoryRegistry {
    async fn upsert_account(&self, id: Uuid, namespace: &str) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock();
        state
            .accounts
            .entry(id)
            .and_modify(|a| {
                a.namespace = namespace.to_string();
                a.updated_at = now;
            })
            .or_insert_with(|| AccountRow {
                id,
                namespace: namespace.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> RegistryResult<Option<AccountRow>> {
        Ok(self.state.lock().accounts.get(&id).cloned())
    }
}

#[async_trait]
impl ClientRepo for MemoryRegistry {
    async fn create_management_client(&self, id: Uuid, namespace: &str) -> RegistryResult<()> {
        let mut state = self.state.lock();
        if state.clients.iter().any(|c| c.namespace.starts_with(namespace)) {
            return Err(RegistryError::AlreadyExists(format!(
                "namespace '{namespace}' already in use"
            )));
        }
        state.clients.push(ManagementClientRow {
            id,
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    async fn get_management_client(
        &self,
        id: Uuid,
    ) -> RegistryResult<Option<ManagementClientRow>> {
        Ok(self
            .state
            .lock()
            .clients
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }
}

#[async_trait]
impl HubRepo for MemoryRegistry {
    async fn checkin_hub(
        &self,
        stable_id: Uuid,
        instance_id: Uuid,
        connection_info: &str,
    ) -> RegistryResult<HubCheckin> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock();

        match state.hubs.get(&stable_id).cloned() {
            None => {
                let hub = HubRow {
                    stable_id,
                    instance_id,
                    connection_info: connection_info.to_string(),
                    last_checkin: now,
                    created_at: now,
                };
                state.hubs.insert(stable_id, hub.clone());
                Ok(HubCheckin {
                    hub,
                    rotated_instance: None,
                    affected_accounts: Vec::new(),
                })
            }
            Some(stored) => {
                let mut rotated_instance = None;
                let mut affected_accounts = Vec::new();

                if stored.instance_id != instance_id {
                    let mut accounts: Vec<Uuid> = state
                        .services
                        .iter()
                        .filter(|s| s.hub_id == stored.instance_id)
                        .map(|s| s.account_id)
                        .collect();
                    accounts.sort();
                    accounts.dedup();
                    state.services.retain(|s| s.hub_id != stored.instance_id);
                    rotated_instance = Some(stored.instance_id);
                    affected_accounts = accounts;
                }

                let hub = HubRow {
                    instance_id,
                    connection_info: connection_info.to_string(),
                    last_checkin: now,
                    ..stored
                };
                state.hubs.insert(stable_id, hub.clone());

                Ok(HubCheckin {
                    hub,
                    rotated_instance,
                    affected_accounts,
                })
            }
        }
    }

    async fn all_hubs(&self) -> RegistryResult<Vec<HubRow>> {
        let mut hubs: Vec<HubRow> = self.state.lock().hubs.values().cloned().collect();
        hubs.sort_by_key(|h| h.created_at);
        Ok(hubs)
    }

    async fn delete_hub(&self, stable_id: Uuid) -> RegistryResult<()> {
        self.check_fault("delete_hub")?;
        self.state.lock().hubs.remove(&stable_id);
        Ok(())
    }
}

#[async_trait]
impl ServiceRepo for MemoryRegistry {
    async fn add_service(&self, service: &NewService) -> RegistryResult<ServiceRow> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock();

        let account_id = service.account_id;
        state
            .accounts
            .entry(account_id)
            .and_modify(|a| {
                a.namespace = service.account_namespace.clone();
                a.updated_at = now;
            })
            .or_insert_with(|| AccountRow {
                id: account_id,
                namespace: service.account_namespace.clone(),
                created_at: now,
                updated_at: now,
            });

        state.next_service_id += 1;
        let row = ServiceRow {
            id: state.next_service_id,
            service_id: service.service_id,
            hub_id: service.hub_id,
            account_id,
            service_type: service.service_type.clone(),
            labels: service.labels.clone(),
            created_at: now,
            updated_at: now,
        };
        state.services.push(row.clone());
        Ok(row)
    }

    async fn remove_service(&self, service_id: Uuid) -> RegistryResult<u64> {
        let mut state = self.state.lock();
        let before = state.services.len();
        state.services.retain(|s| s.service_id != service_id);
        Ok((before - state.services.len()) as u64)
    }

    async fn remove_hub_services(&self, instance_id: Uuid) -> RegistryResult<Vec<Uuid>> {
        self.check_fault("remove_hub_services")?;
        let mut state = self.state.lock();
        let mut accounts: Vec<Uuid> = state
            .services
            .iter()
            .filter(|s| s.hub_id == instance_id)
            .map(|s| s.account_id)
            .collect();
        accounts.sort();
        accounts.dedup();
        state.services.retain(|s| s.hub_id != instance_id);
        Ok(accounts)
    }

    async fn services_for_account(&self, account_id: Uuid) -> RegistryResult<Vec<ServiceRow>> {
        let mut rows: Vec<ServiceRow> = self
            .state
            .lock()
            .services
            .iter()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        Ok(rows)
    }
}

#[async_trait]
impl LabelLinkRepo for MemoryRegistry {
    async fn add_label_link(
        &self,
        account_id: Uuid,
        labels: &str,
        target: &str,
    ) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock();

        if state
            .links
            .iter()
            .any(|l| l.account_id == account_id && l.labels == labels)
        {
            return Err(RegistryError::AlreadyExists(format!("label link '{labels}'")));
        }

        state.next_link_id += 1;
        let row = LabelLinkRow {
            id: state.next_link_id,
            account_id,
            labels: labels.to_string(),
            target: target.to_string(),
            created_at: now,
            updated_at: now,
        };
        state.links.push(row);
        Ok(())
    }

    async fn remove_label_link(&self, account_id: Uuid, labels: &str) -> RegistryResult<u64> {
        let mut state = self.state.lock();
        let before = state.links.len();
        state
            .links
            .retain(|l| !(l.account_id == account_id && l.labels == labels));
        Ok((before - state.links.len()) as u64)
    }

    async fn resolve_label_link(&self, labels: &str) -> RegistryResult<Option<(Uuid, String)>> {
        Ok(self
            .state
            .lock()
            .links
            .iter()
            .find(|l| l.labels == labels)
            .map(|l| (l.account_id, l.target.clone())))
    }

    async fn match_services(
        &self,
        account_id: Uuid,
        target: &LabelSet,
    ) -> RegistryResult<Vec<ServiceRow>> {
        let wanted = target.as_strings();
        let mut rows: Vec<ServiceRow> = self
            .state
            .lock()
            .services
            .iter()
            .filter(|s| {
                s.account_id == account_id && wanted.iter().all(|w| s.labels.contains(w))
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        Ok(rows)
    }
}
