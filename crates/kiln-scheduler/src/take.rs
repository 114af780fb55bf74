//! Taking: a worker's atomic claim of a job.

use chrono::{DateTime, Utc};
use kiln_core::auth::Caller;
use kiln_core::job::{Job, JobStatus};
use kiln_core::secret::{SecretResolver, Variable};
use kiln_core::spawn::{MessageId, SpawnInfo, SpawnMessage};
use kiln_core::worker::{Worker, WorkerEvent};
use kiln_core::{Error, JobId, Result};
use kiln_db::{DbError, TakeOutcome, TakeRecord};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::context::DispatchContext;

/// Body of a take request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeRequest {
    /// The job the worker's hatchery booked for it, if any. Informational.
    #[serde(rename = "bookedJobID", default)]
    pub booked_job_id: Option<JobId>,
    #[serde(rename = "time", default = "Utc::now")]
    pub remote_time: DateTime<Utc>,
}

/// What a worker receives after winning a take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetailWithSecrets {
    pub job: Job,
    pub secrets: Vec<Variable>,
}

impl DispatchContext {
    /// Load the calling worker. A credential whose worker is gone is refused.
    pub(crate) async fn calling_worker(&self, caller: &Caller) -> Result<Worker> {
        let worker_id = caller.worker_id()?;
        match self.store.workers.get(worker_id).await {
            Ok(worker) => Ok(worker),
            Err(DbError::NotFound(_)) => Err(Error::Forbidden("worker is not registered".to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn model_name(&self, worker: &Worker) -> Result<Option<String>> {
        let Some(model_id) = worker.model_id else {
            return Ok(None);
        };
        let model = self.store.models.get(model_id).await?;
        if !model.usable_by(worker.group_id, self.shared_group()) {
            return Err(Error::Forbidden(format!(
                "worker model {} is not available to this worker",
                model.name
            )));
        }
        Ok(Some(model.name))
    }

    /// Claim `job_id` for the calling worker.
    ///
    /// Exactly one of any number of concurrent takes of a job succeeds; the
    /// others get `Conflict` and their workers stay Checking. Secrets are
    /// resolved only once the claim is committed.
    pub async fn take(
        &self,
        caller: &Caller,
        job_id: JobId,
        request: TakeRequest,
    ) -> Result<JobDetailWithSecrets> {
        let worker = self.calling_worker(caller).await?;
        worker.status.on(WorkerEvent::Take)?;
        if worker.disable_requested_at.is_some() {
            return Err(Error::WrongStatus(format!(
                "worker {} is being disabled",
                worker.name
            )));
        }

        let job = self.store.jobs.get(job_id).await?;
        self.ensure_visible(caller, job.group_id)?;
        let model_name = self.model_name(&worker).await?;

        if job.status != JobStatus::Waiting {
            return Err(Error::Conflict(format!(
                "job {} is {}, not Waiting",
                job.id, job.status
            )));
        }

        let mut infos = vec![
            SpawnInfo::new(
                SpawnMessage::new(
                    MessageId::JobTaken,
                    vec![job.id.to_string(), worker.name.clone()],
                ),
                request.remote_time,
            ),
            SpawnInfo::new(
                SpawnMessage::new(
                    MessageId::JobTakenWorkerVersion,
                    vec![
                        worker.name.clone(),
                        worker.version.clone(),
                        worker.os.clone(),
                        worker.arch.clone(),
                    ],
                ),
                request.remote_time,
            ),
        ];
        if request.booked_job_id == Some(job.id) {
            let hatchery = job
                .booked_by
                .as_ref()
                .map(|b| b.hatchery_name.clone())
                .unwrap_or_default();
            infos.push(SpawnInfo::new(
                SpawnMessage::new(MessageId::BookingHonored, vec![worker.name.clone(), hatchery]),
                request.remote_time,
            ));
        }

        let record = TakeRecord {
            job_id,
            worker_id: worker.id,
            worker_name: worker.name.clone(),
            model_name,
            infos,
            started_at: Utc::now(),
        };
        let job = match self.store.dispatch.take(record).await? {
            TakeOutcome::Taken(job) => job,
            TakeOutcome::JobUnavailable(status) => {
                return Err(Error::Conflict(format!(
                    "job {} is {}, not Waiting",
                    job_id, status
                )));
            }
            TakeOutcome::WorkerUnavailable => {
                return Err(Error::WrongStatus(format!(
                    "worker {} is no longer Checking",
                    worker.name
                )));
            }
        };

        info!(job_id = %job.id, worker = %worker.name, "Job taken");

        let secrets = self.store.variables.resolve(&job).await.map_err(|e| {
            error!(job_id = %job.id, error = %e, "Cannot resolve secrets for taken job");
            e
        })?;
        Ok(JobDetailWithSecrets { job, secrets })
    }
}
