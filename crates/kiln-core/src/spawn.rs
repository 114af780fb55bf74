//! Spawn infos: the append-only audit trail of a job.
//!
//! An entry never carries a pre-formatted sentence. It carries a message id
//! and positional arguments, so every presentation layer can render it in the
//! caller's locale. `SpawnMessage::render` is the English fallback used in
//! logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Catalogue of audit messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageId {
    JobInQueue,
    HatcheryStarts,
    HatcheryErrorSpawn,
    HatcheryStartsSuccessfully,
    HatcheryStartDockerPull,
    HatcheryEndDockerPull,
    HatcheryEndDockerPullErr,
    HatcheryCannotStartJob,
    DeprecatedModel,
    WorkerForJob,
    WorkerForJobError,
    JobTaken,
    JobTakenWorkerVersion,
    BookingHonored,
    BookingExpired,
    WorkerEnd,
    WorkerLost,
    JobAbandoned,
    JobError,
}

impl MessageId {
    fn template(&self) -> &'static str {
        match self {
            MessageId::JobInQueue => "Job has been queued",
            MessageId::HatcheryStarts => "Hatchery {} starts spawn worker with model {}",
            MessageId::HatcheryErrorSpawn => {
                "Error while hatchery {} spawn worker with model {} after {}, err: {}"
            }
            MessageId::HatcheryStartsSuccessfully => {
                "Hatchery {} spawn worker {} successfully in {}"
            }
            MessageId::HatcheryStartDockerPull => "Hatchery {} starts docker pull {}...",
            MessageId::HatcheryEndDockerPull => "Hatchery {} docker pull {} done",
            MessageId::HatcheryEndDockerPullErr => {
                "Hatchery {} docker pull {} done with error: {}"
            }
            MessageId::HatcheryCannotStartJob => {
                "No hatchery can spawn a worker corresponding to the job's requirements"
            }
            MessageId::DeprecatedModel => "You are using a deprecated worker model ({})",
            MessageId::WorkerForJob => "This worker {} was created to take this job",
            MessageId::WorkerForJobError => {
                "This worker {} was created to take this job, but does not have all prerequisites: {}"
            }
            MessageId::JobTaken => "Job {} was taken by worker {}",
            MessageId::JobTakenWorkerVersion => "Worker {} version:{} os:{} arch:{}",
            MessageId::BookingHonored => "Worker {} took the job booked by hatchery {}",
            MessageId::BookingExpired => "Booking by hatchery {} expired before a worker took the job",
            MessageId::WorkerEnd => "Worker {} finished working on this job and took {}",
            MessageId::WorkerLost => "Worker {} stopped sending heartbeats, the job is marked as failed",
            MessageId::JobAbandoned => "Worker {} abandoned the job",
            MessageId::JobError => "Unable to run this job: {}",
        }
    }

    /// Number of positional arguments the message expects.
    pub fn arity(&self) -> usize {
        self.template().matches("{}").count()
    }
}

/// A localizable message: id plus positional arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnMessage {
    pub id: MessageId,
    #[serde(default)]
    pub args: Vec<String>,
}

impl SpawnMessage {
    pub fn new(id: MessageId, args: Vec<String>) -> Self {
        Self { id, args }
    }

    pub fn validate(&self) -> Result<()> {
        if self.args.len() != self.id.arity() {
            return Err(Error::InvalidInput(format!(
                "message {:?} takes {} argument(s), got {}",
                self.id,
                self.id.arity(),
                self.args.len()
            )));
        }
        Ok(())
    }

    /// English rendering.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut args = self.args.iter();
        let mut pieces = self.id.template().split("{}").peekable();
        while let Some(piece) = pieces.next() {
            out.push_str(piece);
            if pieces.peek().is_some() {
                out.push_str(args.next().map(String::as_str).unwrap_or("?"));
            }
        }
        out
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnInfo {
    /// When the control plane recorded the entry.
    pub api_time: DateTime<Utc>,
    /// When the reporting worker or hatchery says it happened.
    pub remote_time: DateTime<Utc>,
    pub message: SpawnMessage,
}

impl SpawnInfo {
    pub fn new(message: SpawnMessage, remote_time: DateTime<Utc>) -> Self {
        Self {
            api_time: Utc::now(),
            remote_time,
            message,
        }
    }

    /// An entry emitted by the control plane itself.
    pub fn now(id: MessageId, args: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            api_time: now,
            remote_time: now,
            message: SpawnMessage::new(id, args),
        }
    }
}

/// An entry as submitted by a worker or hatchery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnInfoRequest {
    #[serde(rename = "remoteTime", default = "Utc::now")]
    pub remote_time: DateTime<Utc>,
    pub message: SpawnMessage,
}

impl SpawnInfoRequest {
    pub fn into_spawn_info(self) -> Result<SpawnInfo> {
        self.message.validate()?;
        Ok(SpawnInfo::new(self.message, self.remote_time))
    }
}
