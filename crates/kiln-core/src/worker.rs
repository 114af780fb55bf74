//! Worker types and the worker status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::{ConsumerId, Error, GroupId, HatcheryId, JobId, ModelId, Result, WorkerId};

/// Worker status.
///
/// `Checking` means "about to take work right now", not a resting state,
/// which is why re-entering it from itself is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    Checking,
    Waiting,
    Building,
    Disabled,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Checking,
        WorkerStatus::Waiting,
        WorkerStatus::Building,
        WorkerStatus::Disabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Checking => "checking",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Building => "building",
            WorkerStatus::Disabled => "disabled",
        }
    }

    /// Apply `event` to this status.
    ///
    /// This is the complete transition table; every pair not matched here is
    /// rejected and leaves the worker untouched.
    pub fn on(self, event: WorkerEvent) -> std::result::Result<Transition, TransitionError> {
        use WorkerEvent::*;
        use WorkerStatus::*;

        match (self, event) {
            (Checking, RequestWaiting) => Ok(Transition::To(Waiting)),
            (Building, RequestWaiting) => Ok(Transition::To(Waiting)),
            (Waiting, RequestChecking) => Ok(Transition::To(Checking)),
            (Checking, Take) => Ok(Transition::To(Building)),
            (Building, Finish) => Ok(Transition::To(Waiting)),
            (Waiting, Disable) => Ok(Transition::To(Disabled)),
            (Checking, Disable) => Ok(Transition::Deferred(Disabled)),
            (Checking | Waiting | Building, Reap) => Ok(Transition::To(Disabled)),
            (from, event) => Err(TransitionError { from, event }),
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Checking => write!(f, "Checking"),
            WorkerStatus::Waiting => write!(f, "Waiting"),
            WorkerStatus::Building => write!(f, "Building"),
            WorkerStatus::Disabled => write!(f, "Disabled"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "checking" => Ok(WorkerStatus::Checking),
            "waiting" => Ok(WorkerStatus::Waiting),
            "building" => Ok(WorkerStatus::Building),
            "disabled" => Ok(WorkerStatus::Disabled),
            other => Err(Error::Internal(format!("unknown worker status '{}'", other))),
        }
    }
}

/// Something that happens to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerEvent {
    /// The worker asks to go back to idle.
    RequestWaiting,
    /// The worker announces it is about to take a job.
    RequestChecking,
    /// The worker won a take.
    Take,
    /// The worker reported the result of its job.
    Finish,
    /// An administrator or the owning hatchery asks for the worker to stop.
    Disable,
    /// The reaper found the worker silent past the heartbeat timeout.
    Reap,
}

impl WorkerEvent {
    pub const ALL: [WorkerEvent; 6] = [
        WorkerEvent::RequestWaiting,
        WorkerEvent::RequestChecking,
        WorkerEvent::Take,
        WorkerEvent::Finish,
        WorkerEvent::Disable,
        WorkerEvent::Reap,
    ];
}

/// Outcome of an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the status now.
    To(WorkerStatus),
    /// Move to the status once the worker leaves its current one.
    Deferred(WorkerStatus),
}

/// A rejected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: WorkerStatus,
    pub event: WorkerEvent,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} is not allowed while worker is {}", self.event, self.from)
    }
}

impl std::error::Error for TransitionError {}

impl From<TransitionError> for Error {
    fn from(err: TransitionError) -> Self {
        Error::WrongStatus(err.to_string())
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub group_id: GroupId,
    /// `None` when the worker was started by hand.
    pub hatchery_id: Option<HatcheryId>,
    pub model_id: Option<ModelId>,
    pub last_beat: DateTime<Utc>,
    /// Set if and only if the worker is building.
    pub current_job_id: Option<JobId>,
    pub consumer_id: ConsumerId,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub capabilities: Vec<String>,
    pub disable_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Arguments a worker presents when registering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationForm {
    pub name: String,
    /// Pre-issued group token.
    pub token: String,
    #[serde(default)]
    pub hatchery_id: Option<HatcheryId>,
    #[serde(default)]
    pub model_id: Option<ModelId>,
    #[serde(default)]
    pub binary_capabilities: Vec<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

static NAME_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid name pattern")
});

/// Validate a worker or hatchery name.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(format!("{} name is required", kind)));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(Error::InvalidInput(format!(
            "invalid {} name '{}': use letters, digits, '.', '_' or '-'",
            kind, name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerEvent::*;
    use WorkerStatus::*;

    fn allowed() -> Vec<(WorkerStatus, WorkerEvent, Transition)> {
        vec![
            (Checking, RequestWaiting, Transition::To(Waiting)),
            (Building, RequestWaiting, Transition::To(Waiting)),
            (Waiting, RequestChecking, Transition::To(Checking)),
            (Checking, Take, Transition::To(Building)),
            (Building, Finish, Transition::To(Waiting)),
            (Waiting, Disable, Transition::To(Disabled)),
            (Checking, Disable, Transition::Deferred(Disabled)),
            (Checking, Reap, Transition::To(Disabled)),
            (Waiting, Reap, Transition::To(Disabled)),
            (Building, Reap, Transition::To(Disabled)),
        ]
    }

    #[test]
    fn test_transition_table_is_closed() {
        let table = allowed();
        for from in WorkerStatus::ALL {
            for event in WorkerEvent::ALL {
                let expected = table
                    .iter()
                    .find(|(f, e, _)| *f == from && *e == event)
                    .map(|(_, _, t)| *t);
                match (from.on(event), expected) {
                    (Ok(got), Some(want)) => assert_eq!(got, want, "{:?} + {:?}", from, event),
                    (Err(err), None) => {
                        assert_eq!(err.from, from);
                        assert_eq!(err.event, event);
                    }
                    (got, want) => panic!("{:?} + {:?}: got {:?}, want {:?}", from, event, got, want),
                }
            }
        }
    }

    #[test]
    fn test_checking_cannot_reenter_checking() {
        assert!(Checking.on(RequestChecking).is_err());
        assert!(Waiting.on(RequestChecking).is_ok());
    }

    #[test]
    fn test_building_worker_cannot_be_disabled() {
        let err = Building.on(Disable).unwrap_err();
        assert!(matches!(Error::from(err), Error::WrongStatus(_)));
    }

    #[test]
    fn test_disabled_is_a_sink() {
        for event in WorkerEvent::ALL {
            assert!(Disabled.on(event).is_err());
        }
    }

    #[test]
    fn test_status_storage_names() {
        for status in WorkerStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
        assert!("idle".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("worker", "worker-01.eu_west").is_ok());
        assert!(validate_name("worker", "").is_err());
        assert!(validate_name("worker", "-leading-dash").is_err());
        assert!(validate_name("worker", "has space").is_err());
    }
}
