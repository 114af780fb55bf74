//! Transitions spanning a job and a worker.
//!
//! Each method runs in one transaction. The job row is always locked first,
//! then the worker row, so concurrent takes of one job serialize on the job
//! and exactly one of them sees it Waiting, and a result racing a release of
//! the same worker queues on the job instead of deadlocking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::job::{Job, JobStatus};
use kiln_core::spawn::{MessageId, SpawnInfo};
use kiln_core::worker::WorkerStatus;
use kiln_core::{JobId, WorkerId};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::repo::job::JobRow;
use crate::repo::worker::WorkerRow;
use crate::{DbError, DbResult};

/// A worker claiming a job.
#[derive(Debug, Clone)]
pub struct TakeRecord {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub model_name: Option<String>,
    pub infos: Vec<SpawnInfo>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TakeOutcome {
    Taken(Job),
    /// The job is no longer Waiting.
    JobUnavailable(JobStatus),
    /// The worker is no longer Checking, or a disable is pending.
    WorkerUnavailable,
}

/// A worker reporting the end of its job.
#[derive(Debug, Clone)]
pub struct FinishRecord {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub status: JobStatus,
    pub duration_ms: i64,
    pub info: SpawnInfo,
    pub done_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FinishOutcome {
    Finished(Job),
    /// The job already left Building.
    JobNotBuilding(JobStatus),
    /// The job is building on another worker.
    NotAssigned,
}

/// Moving a worker out of its current status, failing its job if it was
/// building one.
#[derive(Debug, Clone)]
pub struct ReleaseWorker {
    pub worker_id: WorkerId,
    pub from: Vec<WorkerStatus>,
    pub to: WorkerStatus,
    /// Only release when the last heartbeat is older than this.
    pub beat_before: Option<DateTime<Utc>>,
    /// Spawn info recorded on the failed job; takes the worker name.
    pub job_message: MessageId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub previous: WorkerStatus,
    pub failed_job: Option<JobId>,
}

#[async_trait]
pub trait DispatchRepo: Send + Sync {
    /// Job Waiting to Building and worker Checking to Building, or nothing.
    async fn take(&self, take: TakeRecord) -> DbResult<TakeOutcome>;

    /// Job Building to its final status and worker Building to Waiting, or
    /// nothing.
    async fn finish(&self, finish: FinishRecord) -> DbResult<FinishOutcome>;

    /// Returns `None` when the worker is gone, not in one of `from`, or
    /// heartbeated after `beat_before`.
    async fn release_worker(&self, release: ReleaseWorker) -> DbResult<Option<Released>>;
}

/// A worker that switches jobs this many times during one release is left
/// for the next attempt.
const RELEASE_ATTEMPTS: usize = 3;

/// PostgreSQL implementation.
pub struct PgDispatchRepo {
    pool: PgPool,
}

impl PgDispatchRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One release attempt. `Ok(None)` when the worker's job changed between
    /// the unlocked read and the locks, so the job lock no longer covers it.
    async fn try_release_worker(&self, release: &ReleaseWorker) -> DbResult<Option<Option<Released>>> {
        let seen: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT current_job_id FROM workers WHERE id = $1")
                .bind(release.worker_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        let Some(seen_job) = seen else {
            return Ok(Some(None));
        };

        let mut tx = self.pool.begin().await?;

        if let Some(job_id) = seen_job {
            sqlx::query("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = $1 FOR UPDATE")
            .bind(release.worker_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(Some(None));
        };
        if row.current_job_id.is_some() && row.current_job_id != seen_job {
            tx.rollback().await?;
            return Ok(None);
        }

        let previous: WorkerStatus = row.status.parse()?;
        if !release.from.contains(&previous) {
            return Ok(Some(None));
        }
        if release.beat_before.is_some_and(|before| row.last_beat >= before) {
            return Ok(Some(None));
        }

        sqlx::query(
            r#"
            UPDATE workers SET status = $2, current_job_id = NULL, disable_requested_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(release.worker_id.as_uuid())
        .bind(release.to.as_str())
        .execute(&mut *tx)
        .await?;

        let mut failed_job = None;
        if let (WorkerStatus::Building, Some(job_id)) = (previous, row.current_job_id) {
            let info = SpawnInfo::now(release.job_message, vec![row.name.clone()]);
            let failed: Option<Uuid> = sqlx::query_scalar(
                r#"
                UPDATE jobs SET
                    status = 'fail',
                    done_at = $3,
                    spawn_infos = spawn_infos || $4
                WHERE id = $1 AND status = 'building' AND assigned_worker_id = $2
                RETURNING id
                "#,
            )
            .bind(job_id)
            .bind(release.worker_id.as_uuid())
            .bind(release.at)
            .bind(Json(vec![info]))
            .fetch_optional(&mut *tx)
            .await?;
            failed_job = failed.map(JobId::from_uuid);
        }

        tx.commit().await?;
        Ok(Some(Some(Released {
            previous,
            failed_job,
        })))
    }
}

#[async_trait]
impl DispatchRepo for PgDispatchRepo {
    async fn take(&self, take: TakeRecord) -> DbResult<TakeOutcome> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                status = 'building',
                assigned_worker_id = $2,
                assigned_worker_name = $3,
                assigned_model = $4,
                started_at = $5,
                spawn_infos = spawn_infos || $6
            WHERE id = $1 AND status = 'waiting'
            RETURNING *
            "#,
        )
        .bind(take.job_id.as_uuid())
        .bind(take.worker_id.as_uuid())
        .bind(&take.worker_name)
        .bind(&take.model_name)
        .bind(take.started_at)
        .bind(Json(&take.infos))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                .bind(take.job_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
            return match status {
                Some(status) => Ok(TakeOutcome::JobUnavailable(status.parse()?)),
                None => Err(DbError::NotFound(format!("job {}", take.job_id))),
            };
        };

        let claimed = sqlx::query(
            r#"
            UPDATE workers SET status = 'building', current_job_id = $2
            WHERE id = $1 AND status = 'checking' AND disable_requested_at IS NULL
            "#,
        )
        .bind(take.worker_id.as_uuid())
        .bind(take.job_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(TakeOutcome::WorkerUnavailable);
        }

        tx.commit().await?;
        Ok(TakeOutcome::Taken(job.try_into()?))
    }

    async fn finish(&self, finish: FinishRecord) -> DbResult<FinishOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(finish.job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", finish.job_id)))?;
        let job = Job::try_from(row)?;

        if job.status != JobStatus::Building {
            return Ok(FinishOutcome::JobNotBuilding(job.status));
        }
        if job.assigned_worker_id != Some(finish.worker_id) {
            return Ok(FinishOutcome::NotAssigned);
        }

        let released = sqlx::query(
            r#"
            UPDATE workers SET status = 'waiting', current_job_id = NULL
            WHERE id = $1 AND status = 'building' AND current_job_id = $2
            "#,
        )
        .bind(finish.worker_id.as_uuid())
        .bind(finish.job_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        if released.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(FinishOutcome::NotAssigned);
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                status = $2,
                done_at = $3,
                duration_ms = $4,
                spawn_infos = spawn_infos || $5
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(finish.job_id.as_uuid())
        .bind(finish.status.as_str())
        .bind(finish.done_at)
        .bind(finish.duration_ms)
        .bind(Json(vec![&finish.info]))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(FinishOutcome::Finished(row.try_into()?))
    }

    async fn release_worker(&self, release: ReleaseWorker) -> DbResult<Option<Released>> {
        for _ in 0..RELEASE_ATTEMPTS {
            if let Some(outcome) = self.try_release_worker(&release).await? {
                return Ok(outcome);
            }
        }
        // The worker kept moving between jobs; the caller retries later.
        Ok(None)
    }
}
