//! Lease-based mutual exclusion for competing consumers.
//!
//! Every delivered queue message is guarded by a lock key derived from its
//! delivery position. Acquisition is one atomic upsert that only steals
//! leases that have already expired, so exactly one of any number of racing
//! workers wins. A worker that dies mid-message simply lets the lease lapse
//! and the message becomes retryable.
//!
//! [`LeaseStore::held`] exists purely as a fast path to skip obviously
//! contended messages without an acquisition attempt. It is not a
//! correctness mechanism: a check-then-acquire race is possible and
//! harmless, because acquisition itself is atomic.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;

/// Handle to the lease table. Each instance has its own holder id, so a
/// release only ever removes leases this instance acquired.
#[derive(Clone)]
pub struct LeaseStore {
    pool: SqlitePool,
    holder: String,
}

impl LeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4().to_string(),
        }
    }

    /// Non-blocking acquire. Returns false while another holder's lease is
    /// still live.
    pub async fn try_acquire(&self, key: &str, lease_secs: u64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + lease_secs as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO leases (key, holder, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(&self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Idempotent release. Safe after expiry: if someone else has since
    /// taken the key, their lease is left untouched.
    pub async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE key = ?1 AND holder = ?2")
            .bind(key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fast-path existence check (non-authoritative, see module docs).
    pub async fn held(&self, key: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM leases WHERE key = ?1 AND expires_at > ?2)",
        )
        .bind(key)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Drop expired leases. Called opportunistically from the worker loop.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("DELETE FROM leases WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
