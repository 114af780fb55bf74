//! Named TTL locks.
//!
//! The only cross-process mutual exclusion in the system. It guards the
//! reaper's disable/delete passes against concurrently running replicas.
//! Booking and taking never use it.

use async_trait::async_trait;
use std::time::Duration;

use crate::{Result, WorkerId};

/// Proof of holding a key. Only the holder's lease can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub owner: String,
}

impl LockLease {
    /// A lease on `key` with a fresh owner token.
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            owner: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to acquire `key` for `ttl`. Never blocks; returns `None` when the
    /// key is held by someone else and has not expired.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>>;

    /// Release a lease. A no-op once the lease expired and another holder
    /// took the key.
    async fn unlock(&self, lease: &LockLease) -> Result<()>;
}

/// Lock key guarding reaper work on one worker.
pub fn worker_lock_key(id: WorkerId) -> String {
    format!("kiln:reaper:worker:{}", id)
}
