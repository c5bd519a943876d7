//! PostgreSQL-based registry store implementation.

use crate::activity::{ACTIVITY_CHANNEL, ActivityEntry, RouteAdded, RouteService};
use crate::error::{RegistryError, RegistryResult};
use crate::models::*;
use crate::repos::{
    AccountRepo, ClientRepo, HubCheckin, HubRepo, LabelLinkRepo, NewService, ServiceRepo,
};
use crate::store::RegistryStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use trellis_core::LabelSet;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based registry store.
pub struct PostgresRegistry {
    pool: Pool<Postgres>,
}

impl PostgresRegistry {
    /// Connect from a connection URL. Does not run migrations; the
    /// binary runs them under the provisioning lock.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> RegistryResult<Self> {
        let mut opts = PgConnectOptions::from_str(url)?;

        // Server-side statement timeout guards against hung queries.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!("PostgreSQL statement_timeout set to {timeout_ms}ms");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl RegistryStore for PostgresRegistry {
    async fn migrate(&self) -> RegistryResult<()> {
        // PostgreSQL doesn't allow multiple statements in a prepared
        // statement; execute each one separately.
        for statement in schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn update_account_routing(&self, account_id: Uuid) -> RegistryResult<()> {
        let Some(account) = self.get_account(account_id).await? else {
            return Err(RegistryError::NotFound(format!("account {account_id}")));
        };
        let services = self.services_for_account(account_id).await?;

        let entry = ActivityEntry {
            route_added: RouteAdded {
                account_id,
                namespace: account.namespace,
                services: services
                    .into_iter()
                    .map(|s| RouteService {
                        hub_id: s.hub_id,
                        service_id: s.service_id,
                        service_type: s.service_type,
                        labels: s.labels,
                    })
                    .collect(),
            },
        };

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(ACTIVITY_CHANNEL)
            .bind(serde_json::to_string(&entry)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountRepo for PostgresRegistry {
    async fn upsert_account(&self, id: Uuid, namespace: &str) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            INSERT INTO accounts (id, namespace, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (id) DO UPDATE
            SET namespace = EXCLUDED.namespace, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id)
        .bind(namespace)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> RegistryResult<Option<AccountRow>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl ClientRepo for PostgresRegistry {
    async fn create_management_client(&self, id: Uuid, namespace: &str) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        // Reject when the requested namespace is a prefix of an existing
        // client's namespace (or equal). starts_with avoids LIKE
        // wildcard pitfalls with namespaces containing `_`.
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM management_clients WHERE starts_with(namespace, $1))",
        )
        .bind(namespace)
        .fetch_one(&mut *tx)
        .await?;

        if taken {
            return Err(RegistryError::AlreadyExists(format!(
                "namespace '{namespace}' already in use"
            )));
        }

        sqlx::query("INSERT INTO management_clients (id, namespace) VALUES ($1, $2)")
            .bind(id)
            .bind(namespace)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_management_client(
        &self,
        id: Uuid,
    ) -> RegistryResult<Option<ManagementClientRow>> {
        let row = sqlx::query_as::<_, ManagementClientRow>(
            "SELECT * FROM management_clients WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl HubRepo for PostgresRegistry {
    async fn checkin_hub(
        &self,
        stable_id: Uuid,
        instance_id: Uuid,
        connection_info: &str,
    ) -> RegistryResult<HubCheckin> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, HubRow>(
            "SELECT * FROM hubs WHERE stable_id = $1 FOR UPDATE",
        )
        .bind(stable_id)
        .fetch_optional(&mut *tx)
        .await?;

        let checkin = match existing {
            None => {
                let hub = sqlx::query_as::<_, HubRow>(
                    r#"
                    INSERT INTO hubs (stable_id, instance_id, connection_info, last_checkin, created_at)
                    VALUES ($1, $2, $3, $4, $4)
                    RETURNING *
                    "#,
                )
                .bind(stable_id)
                .bind(instance_id)
                .bind(connection_info)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;

                HubCheckin {
                    hub,
                    rotated_instance: None,
                    affected_accounts: Vec::new(),
                }
            }
            Some(stored) => {
                let mut rotated_instance = None;
                let mut affected_accounts = Vec::new();

                if stored.instance_id != instance_id {
                    tracing::info!(
                        stable = %stable_id,
                        prev = %stored.instance_id,
                        new = %instance_id,
                        "removing services of previous hub instance"
                    );

                    let accounts: Vec<Uuid> = sqlx::query_scalar(
                        "DELETE FROM services WHERE hub_id = $1 RETURNING account_id",
                    )
                    .bind(stored.instance_id)
                    .fetch_all(&mut *tx)
                    .await?;

                    rotated_instance = Some(stored.instance_id);
                    affected_accounts = dedup_accounts(accounts);
                }

                let hub = sqlx::query_as::<_, HubRow>(
                    r#"
                    UPDATE hubs
                    SET instance_id = $2, connection_info = $3, last_checkin = $4
                    WHERE stable_id = $1
                    RETURNING *
                    "#,
                )
                .bind(stable_id)
                .bind(instance_id)
                .bind(connection_info)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;

                HubCheckin {
                    hub,
                    rotated_instance,
                    affected_accounts,
                }
            }
        };

        tx.commit().await?;
        Ok(checkin)
    }

    async fn all_hubs(&self) -> RegistryResult<Vec<HubRow>> {
        let rows = sqlx::query_as::<_, HubRow>("SELECT * FROM hubs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn delete_hub(&self, stable_id: Uuid) -> RegistryResult<()> {
        sqlx::query("DELETE FROM hubs WHERE stable_id = $1")
            .bind(stable_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceRepo for PostgresRegistry {
    async fn add_service(&self, service: &NewService) -> RegistryResult<ServiceRow> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO accounts (id, namespace, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (id) DO UPDATE
            SET namespace = EXCLUDED.namespace, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(service.account_id)
        .bind(&service.account_namespace)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ServiceRow>(
            r#"
            INSERT INTO services (service_id, hub_id, account_id, type, labels, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING *
            "#,
        )
        .bind(service.service_id)
        .bind(service.hub_id)
        .bind(service.account_id)
        .bind(&service.service_type)
        .bind(&service.labels)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn remove_service(&self, service_id: Uuid) -> RegistryResult<u64> {
        let result = sqlx::query("DELETE FROM services WHERE service_id = $1")
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_hub_services(&self, instance_id: Uuid) -> RegistryResult<Vec<Uuid>> {
        let accounts: Vec<Uuid> =
            sqlx::query_scalar("DELETE FROM services WHERE hub_id = $1 RETURNING account_id")
                .bind(instance_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(dedup_accounts(accounts))
    }

    async fn services_for_account(&self, account_id: Uuid) -> RegistryResult<Vec<ServiceRow>> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            "SELECT * FROM services WHERE account_id = $1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl LabelLinkRepo for PostgresRegistry {
    async fn add_label_link(
        &self,
        account_id: Uuid,
        labels: &str,
        target: &str,
    ) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            INSERT INTO label_links (account_id, labels, target, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(account_id)
        .bind(labels)
        .bind(target)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| RegistryError::from_insert(e, format!("label link '{labels}'")))?;
        Ok(())
    }

    async fn remove_label_link(&self, account_id: Uuid, labels: &str) -> RegistryResult<u64> {
        let result =
            sqlx::query("DELETE FROM label_links WHERE account_id = $1 AND labels = $2")
                .bind(account_id)
                .bind(labels)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn resolve_label_link(&self, labels: &str) -> RegistryResult<Option<(Uuid, String)>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT account_id, target FROM label_links WHERE labels = $1 LIMIT 1",
        )
        .bind(labels)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn match_services(
        &self,
        account_id: Uuid,
        target: &LabelSet,
    ) -> RegistryResult<Vec<ServiceRow>> {
        let target_labels = target.as_strings();
        let rows = sqlx::query_as::<_, ServiceRow>(
            "SELECT * FROM services WHERE account_id = $1 AND labels @> $2 ORDER BY id",
        )
        .bind(account_id)
        .bind(&target_labels)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn dedup_accounts(mut accounts: Vec<Uuid>) -> Vec<Uuid> {
    accounts.sort();
    accounts.dedup();
    accounts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements(POSTGRES_SCHEMA);
        assert!(statements.len() >= 5);
        assert!(statements.iter().all(|s| !s.is_empty()));
        assert!(
            statements
                .iter()
                .any(|s| s.contains("CREATE UNIQUE INDEX IF NOT EXISTS idx_label_links_account_labels"))
        );
    }

    #[test]
    fn dedup_accounts_sorts_and_collapses() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let out = dedup_accounts(vec![a, b, a, b, a]);
        assert_eq!(out.len(), 2);
    }
}
