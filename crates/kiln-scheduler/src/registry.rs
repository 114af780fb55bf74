//! Worker registry: registration, self-transitions, heartbeats and disable.

use chrono::Utc;
use kiln_core::auth::{Caller, Consumer, Identity, generate_token, hash_token};
use kiln_core::spawn::MessageId;
use kiln_core::worker::{
    RegistrationForm, Transition, Worker, WorkerEvent, WorkerStatus, validate_name,
};
use kiln_core::{ConsumerId, Error, GroupId, Result, WorkerId};
use kiln_db::{DbError, ReleaseWorker};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::DispatchContext;

/// A freshly registered worker and its bearer token. The token is never
/// returned again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredWorker {
    pub worker: Worker,
    pub token: String,
}

/// Self-transitions are requests about the worker's own state; rejecting
/// one is a client error rather than a permission problem.
fn self_transition(worker: &Worker, event: WorkerEvent) -> Result<Transition> {
    worker
        .status
        .on(event)
        .map_err(|e| Error::InvalidInput(e.to_string()))
}

impl DispatchContext {
    async fn registration_group(&self, token: &str) -> Result<GroupId> {
        self.store
            .consumers
            .group_for_token(&hash_token(token))
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid registration token".to_string()))
    }

    /// Register a worker. It starts out Checking.
    pub async fn register_worker(&self, form: RegistrationForm) -> Result<RegisteredWorker> {
        validate_name("worker", &form.name)?;
        let group_id = self.registration_group(&form.token).await?;
        let shared = self.shared_group();

        let mut issuer = "group-token".to_string();
        if let Some(hatchery_id) = form.hatchery_id {
            let hatchery = match self.store.hatcheries.get(hatchery_id).await {
                Ok(h) => h,
                Err(DbError::NotFound(_)) => {
                    return Err(Error::NotFound(format!("unknown hatchery {}", hatchery_id)));
                }
                Err(e) => return Err(e.into()),
            };
            if hatchery.group_id != group_id && Some(hatchery.group_id) != shared {
                return Err(Error::Forbidden(format!(
                    "hatchery {} does not serve this group",
                    hatchery.name
                )));
            }
            issuer = format!("hatchery:{}", hatchery.name);
        }
        if let Some(model_id) = form.model_id {
            let model = self.store.models.get(model_id).await?;
            if !model.usable_by(group_id, shared) {
                return Err(Error::Forbidden(format!(
                    "worker model {} is not available to this group",
                    model.name
                )));
            }
        }

        let now = Utc::now();
        let worker = Worker {
            id: WorkerId::new(),
            name: form.name,
            status: WorkerStatus::Checking,
            group_id,
            hatchery_id: form.hatchery_id,
            model_id: form.model_id,
            last_beat: now,
            current_job_id: None,
            consumer_id: ConsumerId::new(),
            version: form.version,
            os: form.os,
            arch: form.arch,
            capabilities: form.binary_capabilities,
            disable_requested_at: None,
            created_at: now,
        };
        let token = generate_token();
        let consumer = Consumer {
            id: worker.consumer_id,
            identity: Identity::Worker {
                worker_id: worker.id,
                group_id,
            },
            issuer,
            expires_at: None,
            created_at: now,
        };

        self.store
            .workers
            .register(&worker, &consumer, &hash_token(&token))
            .await?;

        info!(
            worker_id = %worker.id,
            worker = %worker.name,
            group_id = %group_id,
            hatchery_id = ?worker.hatchery_id,
            "Worker registered"
        );
        Ok(RegisteredWorker { worker, token })
    }

    /// Waiting → Checking.
    pub async fn request_checking(&self, caller: &Caller) -> Result<Worker> {
        let worker = self.calling_worker(caller).await?;
        self_transition(&worker, WorkerEvent::RequestChecking)?;

        if !self
            .store
            .workers
            .set_status(worker.id, worker.status, WorkerStatus::Checking)
            .await?
        {
            return Err(Error::Conflict(format!(
                "worker {} changed status concurrently",
                worker.name
            )));
        }
        Ok(self.store.workers.get(worker.id).await?)
    }

    /// Checking → Waiting, or Building → Waiting when the worker abandons
    /// its job. The abandoned job is failed.
    pub async fn request_waiting(&self, caller: &Caller) -> Result<Worker> {
        let worker = self.calling_worker(caller).await?;
        self_transition(&worker, WorkerEvent::RequestWaiting)?;

        let moved = if worker.status == WorkerStatus::Building {
            let released = self
                .store
                .dispatch
                .release_worker(ReleaseWorker {
                    worker_id: worker.id,
                    from: vec![WorkerStatus::Building],
                    to: WorkerStatus::Waiting,
                    beat_before: None,
                    job_message: MessageId::JobAbandoned,
                    at: Utc::now(),
                })
                .await?;
            if let Some(released) = &released {
                info!(
                    worker = %worker.name,
                    job_id = ?released.failed_job,
                    "Worker abandoned its job"
                );
            }
            released.is_some()
        } else {
            self.store
                .workers
                .set_status(worker.id, worker.status, WorkerStatus::Waiting)
                .await?
        };

        if !moved {
            return Err(Error::Conflict(format!(
                "worker {} changed status concurrently",
                worker.name
            )));
        }
        Ok(self.store.workers.get(worker.id).await?)
    }

    /// Heartbeat. Disabled and deleted workers are refused.
    pub async fn refresh_worker(&self, caller: &Caller) -> Result<()> {
        let worker_id = caller.worker_id()?;
        if !self.store.workers.refresh(worker_id, Utc::now()).await? {
            return Err(Error::Forbidden(
                "worker is disabled or not registered".to_string(),
            ));
        }
        Ok(())
    }

    /// The calling worker leaves. It is disabled at once (failing its job if
    /// it was building) and deleted by the next delete sweep.
    pub async fn unregister_worker(&self, caller: &Caller) -> Result<()> {
        let worker = self.calling_worker(caller).await?;
        let released = self
            .store
            .dispatch
            .release_worker(ReleaseWorker {
                worker_id: worker.id,
                from: vec![
                    WorkerStatus::Checking,
                    WorkerStatus::Waiting,
                    WorkerStatus::Building,
                ],
                to: WorkerStatus::Disabled,
                beat_before: None,
                job_message: MessageId::JobAbandoned,
                at: Utc::now(),
            })
            .await?;

        if let Some(released) = released {
            info!(
                worker = %worker.name,
                previous = %released.previous,
                job_id = ?released.failed_job,
                "Worker unregistered"
            );
        }
        Ok(())
    }

    /// Disable a worker. Allowed to administrators and to the hatchery that
    /// spawned it. A Checking worker is disabled once it stops checking.
    pub async fn disable_worker(&self, caller: &Caller, worker_id: WorkerId) -> Result<Worker> {
        let worker = self.store.workers.get(worker_id).await?;
        let allowed = caller.is_admin()
            || matches!(
                caller.identity,
                Identity::Hatchery { hatchery_id, .. } if worker.hatchery_id == Some(hatchery_id)
            );
        if !allowed {
            return Err(Error::Forbidden(format!(
                "not allowed to disable worker {}",
                worker.name
            )));
        }

        let done = match worker.status.on(WorkerEvent::Disable)? {
            Transition::To(to) => {
                self.store
                    .workers
                    .set_status(worker.id, worker.status, to)
                    .await?
            }
            Transition::Deferred(_) => {
                self.store
                    .workers
                    .request_disable(worker.id, Utc::now())
                    .await?
            }
        };
        if !done {
            return Err(Error::Conflict(format!(
                "worker {} changed status concurrently",
                worker.name
            )));
        }

        info!(worker = %worker.name, from = %worker.status, "Worker disable requested");
        Ok(self.store.workers.get(worker.id).await?)
    }

    /// Administrators see every worker, a hatchery sees those it spawned.
    pub async fn list_workers(&self, caller: &Caller) -> Result<Vec<Worker>> {
        let filter = match caller.identity {
            _ if caller.is_admin() => None,
            Identity::Hatchery { hatchery_id, .. } => Some(hatchery_id),
            _ => {
                return Err(Error::Forbidden(
                    "only administrators and hatcheries list workers".to_string(),
                ));
            }
        };
        Ok(self.store.workers.list(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::take::TakeRequest;
    use crate::testing::Fixture;
    use kiln_core::HatcheryId;
    use kiln_core::job::JobStatus;

    #[tokio::test]
    async fn test_register_starts_checking() {
        let fx = Fixture::new().await;
        let (caller, reg) = fx.worker("w1").await;
        assert_eq!(reg.worker.status, WorkerStatus::Checking);
        assert_eq!(reg.worker.group_id, fx.group);
        assert_eq!(caller.worker_id().unwrap(), reg.worker.id);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_token_and_name() {
        let fx = Fixture::new().await;
        let mut form = fx.form("w1");
        form.token = "nope".to_string();
        assert!(matches!(
            fx.ctx.register_worker(form).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            fx.ctx.register_worker(fx.form("bad name")).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_register_with_unknown_hatchery_is_not_found() {
        let fx = Fixture::new().await;
        let mut form = fx.form("w1");
        form.hatchery_id = Some(HatcheryId::new());
        assert!(matches!(
            fx.ctx.register_worker(form).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let fx = Fixture::new().await;
        fx.worker("w1").await;
        assert!(matches!(
            fx.ctx.register_worker(fx.form("w1")).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_checking_twice_is_bad_request() {
        let fx = Fixture::new().await;
        let (w1, _) = fx.worker("w1").await;
        assert!(matches!(
            fx.ctx.request_checking(&w1).await,
            Err(Error::InvalidInput(_))
        ));

        let waiting = fx.ctx.request_waiting(&w1).await.unwrap();
        assert_eq!(waiting.status, WorkerStatus::Waiting);
        let checking = fx.ctx.request_checking(&w1).await.unwrap();
        assert_eq!(checking.status, WorkerStatus::Checking);
    }

    #[tokio::test]
    async fn test_abandoning_a_job_fails_it() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, _) = fx.worker("w1").await;
        fx.ctx
            .take(
                &w1,
                job.id,
                TakeRequest {
                    booked_job_id: None,
                    remote_time: Utc::now(),
                },
            )
            .await
            .unwrap();

        let worker = fx.ctx.request_waiting(&w1).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Waiting);
        assert!(worker.current_job_id.is_none());

        let job = fx.ctx.job_detail(&fx.service(), job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert_eq!(
            job.spawn_infos.last().unwrap().message.id,
            MessageId::JobAbandoned
        );
    }

    #[tokio::test]
    async fn test_refresh_after_disable_is_forbidden() {
        let fx = Fixture::new().await;
        let (w1, _) = fx.worker("w1").await;
        fx.ctx.refresh_worker(&w1).await.unwrap();
        fx.ctx.unregister_worker(&w1).await.unwrap();
        assert!(matches!(
            fx.ctx.refresh_worker(&w1).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_building_worker() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, reg) = fx.worker("w1").await;
        fx.ctx
            .take(
                &w1,
                job.id,
                TakeRequest {
                    booked_job_id: None,
                    remote_time: Utc::now(),
                },
            )
            .await
            .unwrap();

        fx.ctx.unregister_worker(&w1).await.unwrap();
        fx.ctx.unregister_worker(&w1).await.unwrap();

        let worker = fx.ctx.store.workers.get(reg.worker.id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Disabled);
        assert!(worker.current_job_id.is_none());
        let job = fx.ctx.job_detail(&fx.service(), job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Fail);
    }

    #[tokio::test]
    async fn test_disable_checking_worker_is_deferred() {
        let fx = Fixture::new().await;
        let (_, reg) = fx.worker("w1").await;

        let worker = fx.ctx.disable_worker(&fx.admin(), reg.worker.id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Checking);
        assert!(worker.disable_requested_at.is_some());
    }

    #[tokio::test]
    async fn test_disable_building_worker_is_forbidden() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (w1, reg) = fx.worker("w1").await;
        fx.ctx
            .take(
                &w1,
                job.id,
                TakeRequest {
                    booked_job_id: None,
                    remote_time: Utc::now(),
                },
            )
            .await
            .unwrap();

        let err = fx
            .ctx
            .disable_worker(&fx.admin(), reg.worker.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WrongStatus(_)));
    }

    #[tokio::test]
    async fn test_only_owning_hatchery_may_disable() {
        let fx = Fixture::new().await;
        let (h1, reg1) = fx.hatchery("h1").await;
        let (h2, _) = fx.hatchery("h2").await;

        let mut form = fx.form("w1");
        form.hatchery_id = Some(reg1.hatchery.id);
        let (w1, reg) = fx.register(form).await;
        fx.ctx.request_waiting(&w1).await.unwrap();

        assert!(matches!(
            fx.ctx.disable_worker(&h2, reg.worker.id).await,
            Err(Error::Forbidden(_))
        ));
        let worker = fx.ctx.disable_worker(&h1, reg.worker.id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Disabled);

        assert_eq!(fx.ctx.list_workers(&h1).await.unwrap().len(), 1);
        assert!(fx.ctx.list_workers(&h2).await.unwrap().is_empty());
        assert!(matches!(
            fx.ctx.list_workers(&w1).await,
            Err(Error::Forbidden(_))
        ));
    }
}
