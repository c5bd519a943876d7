//! Leased named locks.
//!
//! A keyed table provides cross-replica critical sections (schema
//! provisioning, leader-elected maintenance). Leases carry an expiry;
//! a lease can only be stolen once it has expired, and holders renew
//! with a heartbeat while inside the critical section.

use crate::error::RegistryResult;
use sqlx::{Pool, Postgres};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Leased-lock manager over a keyed table.
pub struct LeaseLock {
    pool: Pool<Postgres>,
    table: String,
}

/// A held lease.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub name: String,
    owner: Uuid,
}

impl LeaseLock {
    /// The table name must be a trusted identifier (it is interpolated,
    /// not bound).
    pub fn new(pool: Pool<Postgres>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Create the lock table. Idempotent; the table might exist.
    pub async fn create_table(&self) -> RegistryResult<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                owner UUID NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.table
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Try to acquire the named lease for `ttl`. Returns `None` when
    /// another owner holds an unexpired lease.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> RegistryResult<Option<LockHandle>> {
        let owner = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let sql = format!(
            r#"
            INSERT INTO {table} (name, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE {table}.expires_at < $4
            RETURNING name
            "#,
            table = self.table
        );
        let acquired: Option<String> = sqlx::query_scalar(&sql)
            .bind(name)
            .bind(owner)
            .bind(now + ttl)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(acquired.map(|name| LockHandle { name, owner }))
    }

    /// Extend a held lease. Returns false when the lease was lost.
    pub async fn renew(&self, handle: &LockHandle, ttl: Duration) -> RegistryResult<bool> {
        let sql = format!(
            "UPDATE {} SET expires_at = $1 WHERE name = $2 AND owner = $3",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(OffsetDateTime::now_utc() + ttl)
            .bind(&handle.name)
            .bind(handle.owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release a held lease. Releasing a lost lease is a no-op.
    pub async fn release(&self, handle: LockHandle) -> RegistryResult<()> {
        let sql = format!("DELETE FROM {} WHERE name = $1 AND owner = $2", self.table);
        sqlx::query(&sql)
            .bind(&handle.name)
            .bind(handle.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
