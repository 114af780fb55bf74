//! Caller identities and authorization scopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ConsumerId, Error, GroupId, HatcheryId, Result, WorkerId};

/// Who is behind a bearer token. Exactly one kind per token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Identity {
    User {
        username: String,
        admin: bool,
        groups: Vec<GroupId>,
    },
    Worker {
        worker_id: WorkerId,
        group_id: GroupId,
    },
    Hatchery {
        hatchery_id: HatcheryId,
        group_id: GroupId,
    },
    Service {
        name: String,
    },
}

/// An authentication credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumer {
    pub id: ConsumerId,
    pub identity: Identity,
    pub issuer: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Consumer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Which jobs a caller may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupScope {
    All,
    Groups(Vec<GroupId>),
}

impl GroupScope {
    pub fn contains(&self, group_id: GroupId) -> bool {
        match self {
            GroupScope::All => true,
            GroupScope::Groups(groups) => groups.contains(&group_id),
        }
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone)]
pub struct Caller {
    pub consumer_id: ConsumerId,
    pub identity: Identity,
    pub issuer: String,
}

impl Caller {
    pub fn from_consumer(consumer: Consumer) -> Self {
        Self {
            consumer_id: consumer.id,
            identity: consumer.identity,
            issuer: consumer.issuer,
        }
    }

    /// Groups whose jobs the caller can see. Workers and hatcheries of the
    /// shared infrastructure group serve every group.
    pub fn scope(&self, shared_group: Option<GroupId>) -> GroupScope {
        match &self.identity {
            Identity::User { admin: true, .. } | Identity::Service { .. } => GroupScope::All,
            Identity::User { groups, .. } => GroupScope::Groups(groups.clone()),
            Identity::Worker { group_id, .. } | Identity::Hatchery { group_id, .. } => {
                if Some(*group_id) == shared_group {
                    GroupScope::All
                } else {
                    GroupScope::Groups(vec![*group_id])
                }
            }
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.identity, Identity::User { admin: true, .. })
    }

    pub fn worker_id(&self) -> Result<WorkerId> {
        match self.identity {
            Identity::Worker { worker_id, .. } => Ok(worker_id),
            _ => Err(Error::Forbidden("only workers can call this route".to_string())),
        }
    }

    pub fn hatchery_id(&self) -> Result<HatcheryId> {
        match self.identity {
            Identity::Hatchery { hatchery_id, .. } => Ok(hatchery_id),
            _ => Err(Error::Forbidden("only hatcheries can call this route".to_string())),
        }
    }

    pub fn require_service(&self) -> Result<()> {
        match self.identity {
            Identity::Service { .. } => Ok(()),
            _ => Err(Error::Forbidden("only services can call this route".to_string())),
        }
    }
}

/// Generate a fresh opaque bearer token.
pub fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Tokens are only ever stored hashed.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
