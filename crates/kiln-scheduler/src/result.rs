//! Job results and the spawn info recorder.

use chrono::Utc;
use kiln_core::auth::{Caller, Identity};
use kiln_core::job::{Job, JobResult};
use kiln_core::spawn::{MessageId, SpawnInfo, SpawnInfoRequest, SpawnMessage};
use kiln_core::{Error, JobId, Result};
use kiln_db::{FinishOutcome, FinishRecord};
use tracing::{debug, info};

use crate::context::DispatchContext;

/// `1500` → `1.500s`.
fn format_duration(ms: i64) -> String {
    format!("{}.{:03}s", ms / 1000, ms % 1000)
}

impl DispatchContext {
    /// Record the final status of a job. Only the worker that took the job
    /// may call this, and only once.
    pub async fn send_result(&self, caller: &Caller, job_id: JobId, result: JobResult) -> Result<Job> {
        result.validate()?;
        let worker = self.calling_worker(caller).await?;

        let record = FinishRecord {
            job_id,
            worker_id: worker.id,
            status: result.status,
            duration_ms: result.duration,
            info: SpawnInfo::new(
                SpawnMessage::new(
                    MessageId::WorkerEnd,
                    vec![worker.name.clone(), format_duration(result.duration)],
                ),
                result.remote_time,
            ),
            done_at: Utc::now(),
        };

        match self.store.dispatch.finish(record).await? {
            FinishOutcome::Finished(job) => {
                info!(
                    job_id = %job.id,
                    worker = %worker.name,
                    status = %job.status,
                    duration_ms = result.duration,
                    "Job finished"
                );
                Ok(job)
            }
            FinishOutcome::JobNotBuilding(status) => Err(Error::Conflict(format!(
                "job {} is {}, its result was already recorded",
                job_id, status
            ))),
            FinishOutcome::NotAssigned => Err(Error::Forbidden(format!(
                "job {} is not assigned to worker {}",
                job_id, worker.name
            ))),
        }
    }

    /// Append audit entries to an active job, in submission order.
    pub async fn append_spawn_infos(
        &self,
        caller: &Caller,
        job_id: JobId,
        entries: Vec<SpawnInfoRequest>,
    ) -> Result<()> {
        if !matches!(
            caller.identity,
            Identity::Worker { .. } | Identity::Hatchery { .. }
        ) {
            return Err(Error::Forbidden(
                "only workers and hatcheries record spawn infos".to_string(),
            ));
        }

        let infos = entries
            .into_iter()
            .map(SpawnInfoRequest::into_spawn_info)
            .collect::<Result<Vec<_>>>()?;

        let job = self.store.jobs.get(job_id).await?;
        self.ensure_visible(caller, job.group_id)?;

        if !job.status.is_active() || !self.store.jobs.append_spawn_infos(job_id, &infos).await? {
            return Err(Error::Conflict(format!(
                "job {} is {}, it no longer accepts spawn infos",
                job_id, job.status
            )));
        }

        debug!(job_id = %job_id, count = infos.len(), "Spawn infos recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::take::TakeRequest;
    use crate::testing::Fixture;
    use kiln_core::job::JobStatus;
    use kiln_core::worker::WorkerStatus;

    fn result(status: JobStatus) -> JobResult {
        JobResult {
            status,
            duration: 1500,
            remote_time: Utc::now(),
        }
    }

    fn take_request() -> TakeRequest {
        TakeRequest {
            booked_job_id: None,
            remote_time: Utc::now(),
        }
    }

    fn spawn_info(id: MessageId, args: &[&str]) -> SpawnInfoRequest {
        SpawnInfoRequest {
            remote_time: Utc::now(),
            message: SpawnMessage::new(id, args.iter().map(|a| a.to_string()).collect()),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(1500), "1.500s");
        assert_eq!(format_duration(42), "0.042s");
    }

    #[tokio::test]
    async fn test_result_releases_worker() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, reg) = fx.worker("w1").await;
        fx.ctx.take(&w1, job.id, take_request()).await.unwrap();

        let done = fx.ctx.send_result(&w1, job.id, result(JobStatus::Success)).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.duration_ms, Some(1500));
        let end = done.spawn_infos.last().unwrap();
        assert_eq!(end.message.id, MessageId::WorkerEnd);
        assert_eq!(end.message.args, vec!["w1".to_string(), "1.500s".to_string()]);

        let worker = fx.ctx.store.workers.get(reg.worker.id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Waiting);
        assert!(worker.current_job_id.is_none());
    }

    #[tokio::test]
    async fn test_second_result_conflicts() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, _) = fx.worker("w1").await;
        fx.ctx.take(&w1, job.id, take_request()).await.unwrap();
        fx.ctx.send_result(&w1, job.id, result(JobStatus::Fail)).await.unwrap();

        let err = fx
            .ctx
            .send_result(&w1, job.id, result(JobStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let job = fx.ctx.job_detail(&fx.service(), job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Fail);
    }

    #[tokio::test]
    async fn test_other_worker_cannot_report() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, _) = fx.worker("w1").await;
        let (w2, _) = fx.worker("w2").await;
        fx.ctx.take(&w1, job.id, take_request()).await.unwrap();

        let err = fx
            .ctx
            .send_result(&w2, job.id, result(JobStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_non_final_status_is_rejected() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, _) = fx.worker("w1").await;
        fx.ctx.take(&w1, job.id, take_request()).await.unwrap();

        let err = fx
            .ctx
            .send_result(&w1, job.id, result(JobStatus::Waiting))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_spawn_infos_are_appended_in_order() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (h1, _) = fx.hatchery("h1").await;

        fx.ctx
            .append_spawn_infos(
                &h1,
                job.id,
                vec![
                    spawn_info(MessageId::HatcheryStarts, &["h1", "debian12"]),
                    spawn_info(MessageId::HatcheryStartsSuccessfully, &["h1", "w1", "3s"]),
                ],
            )
            .await
            .unwrap();

        let job = fx.ctx.job_detail(&h1, job.id).await.unwrap();
        let ids: Vec<MessageId> = job.spawn_infos.iter().map(|i| i.message.id).collect();
        assert_eq!(
            ids,
            vec![
                MessageId::JobInQueue,
                MessageId::HatcheryStarts,
                MessageId::HatcheryStartsSuccessfully
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_infos_rejected_on_final_job() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, _) = fx.worker("w1").await;
        fx.ctx.take(&w1, job.id, take_request()).await.unwrap();
        fx.ctx.send_result(&w1, job.id, result(JobStatus::Success)).await.unwrap();

        let err = fx
            .ctx
            .append_spawn_infos(&w1, job.id, vec![spawn_info(MessageId::JobError, &["oops"])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_spawn_info_arity_is_validated() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (h1, _) = fx.hatchery("h1").await;

        let err = fx
            .ctx
            .append_spawn_infos(&h1, job.id, vec![spawn_info(MessageId::HatcheryStarts, &["h1"])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
