//! The application context every handler and background loop runs against.

use chrono::Utc;
use kiln_config::SystemConfig;
use kiln_core::auth::{Caller, GroupScope, hash_token};
use kiln_core::{Error, GroupId, Result};
use kiln_db::Store;
use std::sync::Arc;

/// Repositories plus configuration, passed explicitly to every operation.
#[derive(Clone)]
pub struct DispatchContext {
    pub store: Store,
    pub config: Arc<SystemConfig>,
}

pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl DispatchContext {
    pub fn new(store: Store, config: SystemConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn shared_group(&self) -> Option<GroupId> {
        self.config.shared_group
    }

    pub(crate) fn booking_ttl(&self) -> chrono::Duration {
        to_chrono(self.config.booking.ttl)
    }

    pub(crate) fn hatchery_timeout(&self) -> chrono::Duration {
        to_chrono(self.config.hatchery.heartbeat_timeout)
    }

    pub(crate) fn worker_timeout(&self) -> chrono::Duration {
        to_chrono(self.config.reaper.heartbeat_timeout)
    }

    /// Resolve a bearer token to its caller.
    pub async fn authenticate(&self, token: &str) -> Result<Caller> {
        let consumer = self
            .store
            .consumers
            .find_by_token(&hash_token(token))
            .await?
            .ok_or_else(|| Error::Unauthorized("unknown token".to_string()))?;

        if consumer.is_expired(Utc::now()) {
            return Err(Error::Unauthorized("token expired".to_string()));
        }
        Ok(Caller::from_consumer(consumer))
    }

    pub fn scope(&self, caller: &Caller) -> GroupScope {
        caller.scope(self.shared_group())
    }

    /// Fail with `Forbidden` unless `group_id` is within the caller's scope.
    pub(crate) fn ensure_visible(&self, caller: &Caller, group_id: GroupId) -> Result<()> {
        if self.scope(caller).contains(group_id) {
            Ok(())
        } else {
            Err(Error::Forbidden(
                "this job belongs to another group".to_string(),
            ))
        }
    }
}
