//! The job queue: listing, enqueueing and inspecting jobs.

use kiln_core::auth::{Caller, Identity};
use kiln_core::job::{Job, NewJob};
use kiln_core::{Error, JobId, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::DispatchContext;

/// A worker telling operators it cannot satisfy a job's requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementsError {
    #[serde(rename = "jobID", default)]
    pub job_id: Option<JobId>,
    pub error: String,
}

impl DispatchContext {
    /// Waiting jobs the caller may see, oldest first. A snapshot: nothing
    /// guarantees a listed job is still Waiting when the caller acts on it.
    pub async fn list_waiting(&self, caller: &Caller) -> Result<Vec<Job>> {
        let jobs = self.store.jobs.list_waiting(&self.scope(caller)).await?;
        Ok(jobs)
    }

    /// Log a requirements failure. Job state is left untouched.
    pub async fn report_requirements_error(
        &self,
        caller: &Caller,
        report: RequirementsError,
    ) -> Result<()> {
        let worker_id = caller.worker_id()?;
        if report.error.trim().is_empty() {
            return Err(Error::InvalidInput("error message is required".to_string()));
        }
        let worker = self.store.workers.get(worker_id).await?;

        warn!(
            worker_id = %worker.id,
            worker_name = %worker.name,
            job_id = ?report.job_id,
            error = %report.error,
            "Worker cannot satisfy job requirements"
        );
        Ok(())
    }

    /// Queue a new job. Only the workflow engine (a service caller) enqueues.
    pub async fn enqueue(&self, caller: &Caller, new: NewJob) -> Result<Job> {
        caller.require_service()?;
        new.validate()?;

        let job = self.store.jobs.enqueue(new).await?;
        info!(
            job_id = %job.id,
            source = job.source.as_str(),
            group_id = %job.group_id,
            "Job queued"
        );
        Ok(job)
    }

    /// A job with its spawn infos.
    pub async fn job_detail(&self, caller: &Caller, id: JobId) -> Result<Job> {
        let job = self.store.jobs.get(id).await?;
        if let Identity::Worker { worker_id, .. } = caller.identity {
            if job.assigned_worker_id == Some(worker_id) {
                return Ok(job);
            }
        }
        self.ensure_visible(caller, job.group_id)?;
        Ok(job)
    }
}
