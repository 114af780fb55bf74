//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::auth::GroupScope;
use kiln_core::job::{Booking, Job, NewJob, Requirement};
use kiln_core::spawn::{MessageId, SpawnInfo};
use kiln_core::{GroupId, HatcheryId, JobId, WorkerId};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Database row for jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub source: String,
    pub name: String,
    pub status: String,
    pub group_id: Uuid,
    pub project_key: String,
    pub application: Option<String>,
    pub environment: Option<String>,
    pub requirements: Json<Vec<Requirement>>,
    pub booked_hatchery_id: Option<Uuid>,
    pub booked_hatchery_name: Option<String>,
    pub booked_at: Option<DateTime<Utc>>,
    pub assigned_worker_id: Option<Uuid>,
    pub assigned_worker_name: Option<String>,
    pub assigned_model: Option<String>,
    pub spawn_infos: Json<Vec<SpawnInfo>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let booked_by = match (row.booked_hatchery_id, row.booked_hatchery_name, row.booked_at) {
            (Some(id), Some(name), Some(at)) => Some(Booking {
                hatchery_id: HatcheryId::from_uuid(id),
                hatchery_name: name,
                booked_at: at,
            }),
            _ => None,
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            source: row.source.parse()?,
            name: row.name,
            status: row.status.parse()?,
            group_id: GroupId::from_uuid(row.group_id),
            project_key: row.project_key,
            application: row.application,
            environment: row.environment,
            requirements: row.requirements.0,
            booked_by,
            assigned_worker_id: row.assigned_worker_id.map(WorkerId::from_uuid),
            assigned_worker_name: row.assigned_worker_name,
            assigned_model: row.assigned_model,
            spawn_infos: row.spawn_infos.0,
            queued_at: row.queued_at,
            started_at: row.started_at,
            done_at: row.done_at,
            duration_ms: row.duration_ms,
        })
    }
}

/// Repository for queued jobs.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a Waiting job with its "job in queue" spawn info.
    async fn enqueue(&self, job: NewJob) -> DbResult<Job>;

    async fn get(&self, id: JobId) -> DbResult<Job>;

    /// Waiting jobs in `scope`, oldest first.
    async fn list_waiting(&self, scope: &GroupScope) -> DbResult<Vec<Job>>;

    /// Set the booking if the job is Waiting and unbooked, or booked longer
    /// ago than `ttl`. Returns `None` when the condition does not hold.
    async fn book(&self, id: JobId, booking: Booking, ttl: chrono::Duration) -> DbResult<Option<Job>>;

    /// Clear the booking held by `hatchery_id`.
    async fn release_booking(&self, id: JobId, hatchery_id: HatcheryId) -> DbResult<bool>;

    /// Clear bookings made before `booked_before` on Waiting jobs, appending a
    /// "booking expired" spawn info to each. Returns the released jobs.
    async fn release_stale_bookings(&self, booked_before: DateTime<Utc>) -> DbResult<Vec<Job>>;

    /// Append entries to an active job. Returns `false` when the job is
    /// missing or terminal.
    async fn append_spawn_infos(&self, id: JobId, infos: &[SpawnInfo]) -> DbResult<bool>;
}

/// PostgreSQL implementation.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn enqueue(&self, job: NewJob) -> DbResult<Job> {
        let infos = vec![SpawnInfo::now(MessageId::JobInQueue, vec![])];
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, source, name, status, group_id, project_key, application,
                environment, requirements, spawn_infos, queued_at
            )
            VALUES ($1, $2, $3, 'waiting', $4, $5, $6, $7, $8, $9, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.source.as_str())
        .bind(&job.name)
        .bind(job.group_id.as_uuid())
        .bind(&job.project_key)
        .bind(&job.application)
        .bind(&job.environment)
        .bind(Json(&job.requirements))
        .bind(Json(&infos))
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        row.try_into()
    }

    async fn list_waiting(&self, scope: &GroupScope) -> DbResult<Vec<Job>> {
        let rows = match scope {
            GroupScope::All => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM jobs WHERE status = 'waiting' ORDER BY queued_at, id",
                )
                .fetch_all(&self.pool)
                .await?
            }
            GroupScope::Groups(groups) => {
                let groups: Vec<Uuid> = groups.iter().map(|g| *g.as_uuid()).collect();
                sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT * FROM jobs
                    WHERE status = 'waiting' AND group_id = ANY($1)
                    ORDER BY queued_at, id
                    "#,
                )
                .bind(groups)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn book(&self, id: JobId, booking: Booking, ttl: chrono::Duration) -> DbResult<Option<Job>> {
        // NULL when the TTL reaches past the clock range: no booking expires.
        let expired_before = booking.booked_at.checked_sub_signed(ttl);
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                booked_hatchery_id = $2,
                booked_hatchery_name = $3,
                booked_at = $4
            WHERE id = $1
              AND status = 'waiting'
              AND (booked_at IS NULL OR booked_at < $5)
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(booking.hatchery_id.as_uuid())
        .bind(&booking.hatchery_name)
        .bind(booking.booked_at)
        .bind(expired_before)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn release_booking(&self, id: JobId, hatchery_id: HatcheryId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                booked_hatchery_id = NULL,
                booked_hatchery_name = NULL,
                booked_at = NULL
            WHERE id = $1 AND status = 'waiting' AND booked_hatchery_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(hatchery_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_stale_bookings(&self, booked_before: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        let stale = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'waiting' AND booked_at IS NOT NULL AND booked_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(booked_before)
        .fetch_all(&mut *tx)
        .await?;

        let mut released = Vec::with_capacity(stale.len());
        for row in stale {
            let hatchery = row.booked_hatchery_name.clone().unwrap_or_default();
            let info = SpawnInfo::now(MessageId::BookingExpired, vec![hatchery]);
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                UPDATE jobs SET
                    booked_hatchery_id = NULL,
                    booked_hatchery_name = NULL,
                    booked_at = NULL,
                    spawn_infos = spawn_infos || $2
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(row.id)
            .bind(Json(vec![info]))
            .fetch_one(&mut *tx)
            .await?;
            released.push(Job::try_from(row)?);
        }

        tx.commit().await?;
        Ok(released)
    }

    async fn append_spawn_infos(&self, id: JobId, infos: &[SpawnInfo]) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET spawn_infos = spawn_infos || $2
            WHERE id = $1 AND status IN ('waiting', 'building')
            "#,
        )
        .bind(id.as_uuid())
        .bind(Json(infos))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
