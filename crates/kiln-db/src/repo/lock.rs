//! Named TTL locks backed by the `locks` table.

use async_trait::async_trait;
use kiln_core::lock::{LockLease, LockService};
use sqlx::PgPool;
use std::time::Duration;

use crate::DbError;

/// PostgreSQL implementation of [`LockService`].
///
/// A key is free when no row exists or the row has expired; taking it is a
/// single upsert guarded on expiry that records the new owner.
pub struct PgLockService {
    pool: PgPool,
}

impl PgLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_lock(&self, key: &str, ttl: Duration) -> kiln_core::Result<Option<LockLease>> {
        let lease = LockLease::new(key);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            INSERT INTO locks (key, owner, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3::double precision / 1000))
            ON CONFLICT (key) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE locks.expires_at < NOW()
            "#,
        )
        .bind(&lease.key)
        .bind(&lease.owner)
        .bind(ttl_ms)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok((result.rows_affected() > 0).then_some(lease))
    }

    async fn unlock(&self, lease: &LockLease) -> kiln_core::Result<()> {
        sqlx::query("DELETE FROM locks WHERE key = $1 AND owner = $2")
            .bind(&lease.key)
            .bind(&lease.owner)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(())
    }
}
