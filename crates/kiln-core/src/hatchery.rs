//! Hatchery types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConsumerId, GroupId, HatcheryId};

/// An autoscaling agent that spawns workers for queued jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hatchery {
    pub id: HatcheryId,
    pub name: String,
    pub group_id: GroupId,
    pub consumer_id: ConsumerId,
    pub last_beat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Hatchery {
    /// Only hatcheries that heartbeat recently may book jobs.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_beat <= timeout
    }
}

/// Hatchery registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HatcheryRegistration {
    pub name: String,
    /// Pre-issued group token.
    pub token: String,
}

/// What a hatchery gets back from registration. The uid is its bearer token
/// and is never returned again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredHatchery {
    #[serde(flatten)]
    pub hatchery: Hatchery,
    pub uid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_window() {
        let now = Utc::now();
        let hatchery = Hatchery {
            id: HatcheryId::new(),
            name: "h1".to_string(),
            group_id: GroupId::new(),
            consumer_id: ConsumerId::new(),
            last_beat: now - chrono::Duration::seconds(30),
            created_at: now,
        };
        assert!(hatchery.is_alive(now, chrono::Duration::seconds(60)));
        assert!(!hatchery.is_alive(now, chrono::Duration::seconds(10)));
    }
}
