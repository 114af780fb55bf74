//! Hatchery repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::auth::Consumer;
use kiln_core::hatchery::Hatchery;
use kiln_core::{ConsumerId, GroupId, HatcheryId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repo::consumer::insert_consumer;
use crate::{DbError, DbResult};

/// Database row for hatcheries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HatcheryRow {
    pub id: Uuid,
    pub name: String,
    pub group_id: Uuid,
    pub consumer_id: Uuid,
    pub last_beat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<HatcheryRow> for Hatchery {
    fn from(row: HatcheryRow) -> Self {
        Hatchery {
            id: HatcheryId::from_uuid(row.id),
            name: row.name,
            group_id: GroupId::from_uuid(row.group_id),
            consumer_id: ConsumerId::from_uuid(row.consumer_id),
            last_beat: row.last_beat,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
pub trait HatcheryRepo: Send + Sync {
    /// Insert a hatchery together with its credential. Names are unique
    /// within a group.
    async fn register(&self, hatchery: &Hatchery, consumer: &Consumer, token_hash: &str) -> DbResult<()>;

    async fn get(&self, id: HatcheryId) -> DbResult<Hatchery>;

    async fn heartbeat(&self, id: HatcheryId, at: DateTime<Utc>) -> DbResult<Hatchery>;
}

/// PostgreSQL implementation.
pub struct PgHatcheryRepo {
    pool: PgPool,
}

impl PgHatcheryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HatcheryRepo for PgHatcheryRepo {
    async fn register(&self, hatchery: &Hatchery, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        insert_consumer(&mut *tx, consumer, token_hash).await?;

        sqlx::query(
            r#"
            INSERT INTO hatcheries (id, name, group_id, consumer_id, last_beat, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(hatchery.id.as_uuid())
        .bind(&hatchery.name)
        .bind(hatchery.group_id.as_uuid())
        .bind(hatchery.consumer_id.as_uuid())
        .bind(hatchery.last_beat)
        .bind(hatchery.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::on_insert(e, format!("hatchery name '{}'", hatchery.name)))?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: HatcheryId) -> DbResult<Hatchery> {
        let row = sqlx::query_as::<_, HatcheryRow>("SELECT * FROM hatcheries WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("hatchery {}", id)))?;

        Ok(row.into())
    }

    async fn heartbeat(&self, id: HatcheryId, at: DateTime<Utc>) -> DbResult<Hatchery> {
        let row = sqlx::query_as::<_, HatcheryRow>(
            "UPDATE hatcheries SET last_beat = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("hatchery {}", id)))?;

        Ok(row.into())
    }
}
