//! Queued jobs.
//!
//! Pipeline build jobs and workflow node job runs share one representation;
//! `JobSource` records which engine enqueued the job; the dispatch protocol
//! never branches on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spawn::SpawnInfo;
use crate::{Error, GroupId, HatcheryId, JobId, Result, WorkerId};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Building,
    Success,
    Fail,
    Disabled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Building => "building",
            JobStatus::Success => "success",
            JobStatus::Fail => "fail",
            JobStatus::Disabled => "disabled",
        }
    }

    /// Jobs still accepting spawn infos.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Building)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "Waiting"),
            JobStatus::Building => write!(f, "Building"),
            JobStatus::Success => write!(f, "Success"),
            JobStatus::Fail => write!(f, "Fail"),
            JobStatus::Disabled => write!(f, "Disabled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "building" => Ok(JobStatus::Building),
            "success" => Ok(JobStatus::Success),
            "fail" => Ok(JobStatus::Fail),
            "disabled" => Ok(JobStatus::Disabled),
            other => Err(Error::Internal(format!("unknown job status '{}'", other))),
        }
    }
}

/// Which engine produced the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    PipelineBuild,
    WorkflowNodeRun,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::PipelineBuild => "pipeline_build",
            JobSource::WorkflowNodeRun => "workflow_node_run",
        }
    }
}

impl std::str::FromStr for JobSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pipeline_build" => Ok(JobSource::PipelineBuild),
            "workflow_node_run" => Ok(JobSource::WorkflowNodeRun),
            other => Err(Error::Internal(format!("unknown job source '{}'", other))),
        }
    }
}

/// A capability predicate a worker must satisfy. Matching happens on the
/// worker side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    /// e.g. `binary`, `model`, `os-architecture`, `memory`.
    pub kind: String,
    pub value: String,
}

/// A hatchery's reservation of a waiting job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub hatchery_id: HatcheryId,
    pub hatchery_name: String,
    pub booked_at: DateTime<Utc>,
}

impl Booking {
    /// A booking older than the TTL no longer reserves anything.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.booked_at > ttl
    }
}

/// A unit of build work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source: JobSource,
    pub name: String,
    pub status: JobStatus,
    pub group_id: GroupId,
    pub project_key: String,
    pub application: Option<String>,
    pub environment: Option<String>,
    pub requirements: Vec<Requirement>,
    pub booked_by: Option<Booking>,
    pub assigned_worker_id: Option<WorkerId>,
    pub assigned_worker_name: Option<String>,
    pub assigned_model: Option<String>,
    pub spawn_infos: Vec<SpawnInfo>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Job {
    /// The booking, if one is still in force.
    pub fn active_booking(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> Option<&Booking> {
        self.booked_by.as_ref().filter(|b| !b.is_expired(now, ttl))
    }
}

/// What the workflow engine hands over when it enqueues a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub source: JobSource,
    pub name: String,
    pub group_id: GroupId,
    pub project_key: String,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl NewJob {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("job name is required".to_string()));
        }
        if self.project_key.trim().is_empty() {
            return Err(Error::InvalidInput("project key is required".to_string()));
        }
        for req in &self.requirements {
            if req.name.is_empty() || req.kind.is_empty() {
                return Err(Error::InvalidInput(
                    "requirements need a name and a kind".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A worker's final report for the job it took.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    /// Time spent on the job, in milliseconds.
    #[serde(default)]
    pub duration: i64,
    #[serde(rename = "remoteTime", default = "Utc::now")]
    pub remote_time: DateTime<Utc>,
}

impl JobResult {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.status, JobStatus::Success | JobStatus::Fail) {
            return Err(Error::InvalidInput(format!(
                "a result must be Success or Fail, got {}",
                self.status
            )));
        }
        if self.duration < 0 {
            return Err(Error::InvalidInput("duration cannot be negative".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_booking_expiry() {
        let now = Utc::now();
        let booking = Booking {
            hatchery_id: HatcheryId::new(),
            hatchery_name: "h1".to_string(),
            booked_at: now - chrono::Duration::seconds(90),
        };
        assert!(!booking.is_expired(now, chrono::Duration::seconds(120)));
        assert!(booking.is_expired(now, chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_result_must_be_terminal() {
        let result = JobResult {
            status: JobStatus::Building,
            duration: 10,
            remote_time: Utc::now(),
        };
        assert!(matches!(result.validate(), Err(Error::InvalidInput(_))));

        let result = JobResult {
            status: JobStatus::Success,
            duration: 10,
            remote_time: Utc::now(),
        };
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_result_parses_wire_format() {
        let result: JobResult =
            serde_json::from_str(r#"{"status":"Fail","duration":1500,"remoteTime":"2024-05-01T10:00:00Z"}"#)
                .unwrap();
        assert_eq!(result.status, JobStatus::Fail);
        assert_eq!(result.duration, 1500);
    }

    #[test]
    fn test_new_job_requires_project() {
        let job = NewJob {
            source: JobSource::WorkflowNodeRun,
            name: "build".to_string(),
            group_id: GroupId::new(),
            project_key: " ".to_string(),
            application: None,
            environment: None,
            requirements: vec![],
        };
        assert!(job.validate().is_err());
    }
}
