//! Worker repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::auth::Consumer;
use kiln_core::worker::{Worker, WorkerStatus};
use kiln_core::{ConsumerId, GroupId, HatcheryId, JobId, ModelId, WorkerId};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repo::consumer::insert_consumer;
use crate::{DbError, DbResult};

/// Database row for workers.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerRow {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub group_id: Uuid,
    pub hatchery_id: Option<Uuid>,
    pub model_id: Option<Uuid>,
    pub last_beat: DateTime<Utc>,
    pub current_job_id: Option<Uuid>,
    pub consumer_id: Uuid,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub capabilities: Vec<String>,
    pub disable_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = DbError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        Ok(Worker {
            id: WorkerId::from_uuid(row.id),
            name: row.name,
            status: row.status.parse()?,
            group_id: GroupId::from_uuid(row.group_id),
            hatchery_id: row.hatchery_id.map(HatcheryId::from_uuid),
            model_id: row.model_id.map(ModelId::from_uuid),
            last_beat: row.last_beat,
            current_job_id: row.current_job_id.map(JobId::from_uuid),
            consumer_id: ConsumerId::from_uuid(row.consumer_id),
            version: row.version,
            os: row.os,
            arch: row.arch,
            capabilities: row.capabilities,
            disable_requested_at: row.disable_requested_at,
            created_at: row.created_at,
        })
    }
}

fn status_names(statuses: &[WorkerStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Repository for workers.
///
/// Transitions that touch a job as well (take, finish, release) live on
/// [`DispatchRepo`](crate::DispatchRepo).
#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Insert a worker together with its credential.
    async fn register(&self, worker: &Worker, consumer: &Consumer, token_hash: &str) -> DbResult<()>;

    async fn get(&self, id: WorkerId) -> DbResult<Worker>;

    /// All workers, or only those spawned by `hatchery_id`.
    async fn list(&self, hatchery_id: Option<HatcheryId>) -> DbResult<Vec<Worker>>;

    async fn list_by_status(&self, status: WorkerStatus) -> DbResult<Vec<Worker>>;

    /// Workers in one of `statuses` whose last heartbeat is before `beat_before`.
    async fn list_dead(
        &self,
        statuses: &[WorkerStatus],
        beat_before: DateTime<Utc>,
    ) -> DbResult<Vec<Worker>>;

    /// Workers carrying a pending disable request.
    async fn list_disable_requested(&self) -> DbResult<Vec<Worker>>;

    /// Move a worker from `from` to `to` if it is still in `from`. Not for
    /// transitions into or out of Building.
    async fn set_status(&self, id: WorkerId, from: WorkerStatus, to: WorkerStatus) -> DbResult<bool>;

    /// Record a heartbeat. Disabled workers are not refreshed.
    async fn refresh(&self, id: WorkerId, at: DateTime<Utc>) -> DbResult<bool>;

    /// Record a deferred disable on a Checking worker.
    async fn request_disable(&self, id: WorkerId, at: DateTime<Utc>) -> DbResult<bool>;

    /// Delete a Disabled worker and its credential.
    async fn delete_disabled(&self, id: WorkerId) -> DbResult<bool>;
}

/// PostgreSQL implementation.
pub struct PgWorkerRepo {
    pool: PgPool,
}

impl PgWorkerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepo for PgWorkerRepo {
    async fn register(&self, worker: &Worker, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        insert_consumer(&mut *tx, consumer, token_hash).await?;

        sqlx::query(
            r#"
            INSERT INTO workers (
                id, name, status, group_id, hatchery_id, model_id, last_beat,
                consumer_id, version, os, arch, capabilities, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(worker.id.as_uuid())
        .bind(&worker.name)
        .bind(worker.status.as_str())
        .bind(worker.group_id.as_uuid())
        .bind(worker.hatchery_id.map(Uuid::from))
        .bind(worker.model_id.map(Uuid::from))
        .bind(worker.last_beat)
        .bind(worker.consumer_id.as_uuid())
        .bind(&worker.version)
        .bind(&worker.os)
        .bind(&worker.arch)
        .bind(&worker.capabilities)
        .bind(worker.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::on_insert(e, format!("worker name '{}'", worker.name)))?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: WorkerId) -> DbResult<Worker> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))?;

        row.try_into()
    }

    async fn list(&self, hatchery_id: Option<HatcheryId>) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT * FROM workers
            WHERE $1::uuid IS NULL OR hatchery_id = $1
            ORDER BY name
            "#,
        )
        .bind(hatchery_id.map(Uuid::from))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn list_by_status(&self, status: WorkerStatus) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE status = $1")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn list_dead(
        &self,
        statuses: &[WorkerStatus],
        beat_before: DateTime<Utc>,
    ) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            "SELECT * FROM workers WHERE status = ANY($1) AND last_beat < $2",
        )
        .bind(status_names(statuses))
        .bind(beat_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn list_disable_requested(&self) -> DbResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT * FROM workers
            WHERE disable_requested_at IS NOT NULL AND status <> 'disabled'
            ORDER BY disable_requested_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn set_status(&self, id: WorkerId, from: WorkerStatus, to: WorkerStatus) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers SET
                status = $3,
                disable_requested_at = CASE WHEN $3 = 'disabled' THEN NULL ELSE disable_requested_at END
            WHERE id = $1 AND status = $2 AND current_job_id IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn refresh(&self, id: WorkerId, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET last_beat = $2 WHERE id = $1 AND status <> 'disabled'",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn request_disable(&self, id: WorkerId, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workers SET disable_requested_at = COALESCE(disable_requested_at, $2)
            WHERE id = $1 AND status = 'checking'
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_disabled(&self, id: WorkerId) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let consumer_id: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM workers WHERE id = $1 AND status = 'disabled' RETURNING consumer_id",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(consumer_id) = consumer_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM consumers WHERE id = $1")
            .bind(consumer_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
