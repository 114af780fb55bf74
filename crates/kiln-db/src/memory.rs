//! In-memory implementations of every repository.
//!
//! All state sits behind one mutex, so each operation is trivially atomic
//! and the conditional updates behave exactly like their SQL counterparts.
//! Used by `store "memory"` deployments and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::auth::{Consumer, GroupScope};
use kiln_core::hatchery::Hatchery;
use kiln_core::job::{Booking, Job, JobStatus, NewJob};
use kiln_core::lock::{LockLease, LockService};
use kiln_core::model::WorkerModel;
use kiln_core::secret::{SecretResolver, Variable, VariableScope};
use kiln_core::spawn::{MessageId, SpawnInfo};
use kiln_core::worker::{Worker, WorkerStatus};
use kiln_core::{GroupId, HatcheryId, JobId, ModelId, WorkerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::repo::{
    ConsumerRepo, DispatchRepo, FinishOutcome, FinishRecord, HatcheryRepo, JobRepo, ModelRepo,
    NewVariable, ReleaseWorker, Released, TakeOutcome, TakeRecord, VariableRepo, WorkerRepo,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    workers: HashMap<WorkerId, Worker>,
    hatcheries: HashMap<HatcheryId, Hatchery>,
    /// Keyed by token hash.
    consumers: HashMap<String, Consumer>,
    group_tokens: HashMap<String, GroupId>,
    models: HashMap<ModelId, WorkerModel>,
    variables: Vec<NewVariable>,
}

impl State {
    fn insert_consumer(&mut self, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        if self.consumers.contains_key(token_hash) {
            return Err(DbError::Duplicate("consumer token".to_string()));
        }
        self.consumers
            .insert(token_hash.to_string(), consumer.clone());
        Ok(())
    }

    fn job_mut(&mut self, id: JobId) -> DbResult<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }
}

/// Every repository over process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_queue_time(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
    jobs
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn enqueue(&self, new: NewJob) -> DbResult<Job> {
        let job = Job {
            id: JobId::new(),
            source: new.source,
            name: new.name,
            status: JobStatus::Waiting,
            group_id: new.group_id,
            project_key: new.project_key,
            application: new.application,
            environment: new.environment,
            requirements: new.requirements,
            booked_by: None,
            assigned_worker_id: None,
            assigned_worker_name: None,
            assigned_model: None,
            spawn_infos: vec![SpawnInfo::now(MessageId::JobInQueue, vec![])],
            queued_at: Utc::now(),
            started_at: None,
            done_at: None,
            duration_ms: None,
        };
        self.state.lock().await.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let mut state = self.state.lock().await;
        Ok(state.job_mut(id)?.clone())
    }

    async fn list_waiting(&self, scope: &GroupScope) -> DbResult<Vec<Job>> {
        let state = self.state.lock().await;
        let jobs = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Waiting && scope.contains(j.group_id))
            .cloned()
            .collect();
        Ok(sorted_by_queue_time(jobs))
    }

    async fn book(&self, id: JobId, booking: Booking, ttl: chrono::Duration) -> DbResult<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Waiting || job.active_booking(booking.booked_at, ttl).is_some() {
            return Ok(None);
        }
        job.booked_by = Some(booking);
        Ok(Some(job.clone()))
    }

    async fn release_booking(&self, id: JobId, hatchery_id: HatcheryId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        let booked_by_caller = job
            .booked_by
            .as_ref()
            .is_some_and(|b| b.hatchery_id == hatchery_id);
        if job.status != JobStatus::Waiting || !booked_by_caller {
            return Ok(false);
        }
        job.booked_by = None;
        Ok(true)
    }

    async fn release_stale_bookings(&self, booked_before: DateTime<Utc>) -> DbResult<Vec<Job>> {
        let mut state = self.state.lock().await;
        let mut released = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status != JobStatus::Waiting {
                continue;
            }
            let Some(booking) = job.booked_by.take_if(|b| b.booked_at < booked_before) else {
                continue;
            };
            job.spawn_infos.push(SpawnInfo::now(
                MessageId::BookingExpired,
                vec![booking.hatchery_name],
            ));
            released.push(job.clone());
        }
        Ok(released)
    }

    async fn append_spawn_infos(&self, id: JobId, infos: &[SpawnInfo]) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status.is_active() => {
                job.spawn_infos.extend_from_slice(infos);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl WorkerRepo for MemoryStore {
    async fn register(&self, worker: &Worker, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.workers.values().any(|w| w.name == worker.name) {
            return Err(DbError::Duplicate(format!("worker name '{}'", worker.name)));
        }
        state.insert_consumer(consumer, token_hash)?;
        state.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get(&self, id: WorkerId) -> DbResult<Worker> {
        let state = self.state.lock().await;
        state
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))
    }

    async fn list(&self, hatchery_id: Option<HatcheryId>) -> DbResult<Vec<Worker>> {
        let state = self.state.lock().await;
        let mut workers: Vec<Worker> = state
            .workers
            .values()
            .filter(|w| hatchery_id.is_none() || w.hatchery_id == hatchery_id)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn list_by_status(&self, status: WorkerStatus) -> DbResult<Vec<Worker>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect())
    }

    async fn list_dead(
        &self,
        statuses: &[WorkerStatus],
        beat_before: DateTime<Utc>,
    ) -> DbResult<Vec<Worker>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .filter(|w| statuses.contains(&w.status) && w.last_beat < beat_before)
            .cloned()
            .collect())
    }

    async fn list_disable_requested(&self) -> DbResult<Vec<Worker>> {
        let state = self.state.lock().await;
        let mut workers: Vec<Worker> = state
            .workers
            .values()
            .filter(|w| w.disable_requested_at.is_some() && w.status != WorkerStatus::Disabled)
            .cloned()
            .collect();
        workers.sort_by_key(|w| w.disable_requested_at);
        Ok(workers)
    }

    async fn set_status(&self, id: WorkerId, from: WorkerStatus, to: WorkerStatus) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&id) {
            Some(worker) if worker.status == from && worker.current_job_id.is_none() => {
                worker.status = to;
                if to == WorkerStatus::Disabled {
                    worker.disable_requested_at = None;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn refresh(&self, id: WorkerId, at: DateTime<Utc>) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&id) {
            Some(worker) if worker.status != WorkerStatus::Disabled => {
                worker.last_beat = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_disable(&self, id: WorkerId, at: DateTime<Utc>) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&id) {
            Some(worker) if worker.status == WorkerStatus::Checking => {
                worker.disable_requested_at.get_or_insert(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_disabled(&self, id: WorkerId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let consumer_id = match state.workers.get(&id) {
            Some(worker) if worker.status == WorkerStatus::Disabled => worker.consumer_id,
            _ => return Ok(false),
        };
        state.workers.remove(&id);
        state.consumers.retain(|_, c| c.id != consumer_id);
        Ok(true)
    }
}

#[async_trait]
impl HatcheryRepo for MemoryStore {
    async fn register(&self, hatchery: &Hatchery, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let taken = state
            .hatcheries
            .values()
            .any(|h| h.group_id == hatchery.group_id && h.name == hatchery.name);
        if taken {
            return Err(DbError::Duplicate(format!("hatchery name '{}'", hatchery.name)));
        }
        state.insert_consumer(consumer, token_hash)?;
        state.hatcheries.insert(hatchery.id, hatchery.clone());
        Ok(())
    }

    async fn get(&self, id: HatcheryId) -> DbResult<Hatchery> {
        let state = self.state.lock().await;
        state
            .hatcheries
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("hatchery {}", id)))
    }

    async fn heartbeat(&self, id: HatcheryId, at: DateTime<Utc>) -> DbResult<Hatchery> {
        let mut state = self.state.lock().await;
        let hatchery = state
            .hatcheries
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("hatchery {}", id)))?;
        hatchery.last_beat = at;
        Ok(hatchery.clone())
    }
}

#[async_trait]
impl ConsumerRepo for MemoryStore {
    async fn insert(&self, consumer: &Consumer, token_hash: &str) -> DbResult<()> {
        self.state.lock().await.insert_consumer(consumer, token_hash)
    }

    async fn find_by_token(&self, token_hash: &str) -> DbResult<Option<Consumer>> {
        Ok(self.state.lock().await.consumers.get(token_hash).cloned())
    }

    async fn insert_group_token(&self, token_hash: &str, group_id: GroupId) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.group_tokens.contains_key(token_hash) {
            return Err(DbError::Duplicate("group token".to_string()));
        }
        state.group_tokens.insert(token_hash.to_string(), group_id);
        Ok(())
    }

    async fn group_for_token(&self, token_hash: &str) -> DbResult<Option<GroupId>> {
        Ok(self.state.lock().await.group_tokens.get(token_hash).copied())
    }
}

#[async_trait]
impl ModelRepo for MemoryStore {
    async fn insert(&self, model: &WorkerModel) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let taken = state
            .models
            .values()
            .any(|m| m.group_id == model.group_id && m.name == model.name);
        if taken {
            return Err(DbError::Duplicate(format!("worker model '{}'", model.name)));
        }
        state.models.insert(model.id, model.clone());
        Ok(())
    }

    async fn get(&self, id: ModelId) -> DbResult<WorkerModel> {
        let state = self.state.lock().await;
        state
            .models
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("worker model {}", id)))
    }
}

#[async_trait]
impl VariableRepo for MemoryStore {
    async fn insert(&self, variable: NewVariable) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let taken = state.variables.iter().any(|v| {
            v.group_id == variable.group_id
                && v.scope == variable.scope
                && v.scope_name == variable.scope_name
                && v.name == variable.name
        });
        if taken {
            return Err(DbError::Duplicate(format!("variable '{}'", variable.name)));
        }
        state.variables.push(variable);
        Ok(())
    }
}

#[async_trait]
impl SecretResolver for MemoryStore {
    async fn resolve(&self, job: &Job) -> kiln_core::Result<Vec<Variable>> {
        let state = self.state.lock().await;
        let scope_name = |scope: VariableScope| match scope {
            VariableScope::Project => Some(job.project_key.as_str()),
            VariableScope::Application => job.application.as_deref(),
            VariableScope::Environment => job.environment.as_deref(),
        };
        let mut vars: Vec<Variable> = state
            .variables
            .iter()
            .filter(|v| {
                v.secret
                    && v.group_id == job.group_id
                    && scope_name(v.scope) == Some(v.scope_name.as_str())
            })
            .map(|v| Variable {
                name: Variable::qualified_name(v.scope, &v.name),
                value: v.value.clone(),
                scope: v.scope,
            })
            .collect();
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vars)
    }
}

#[async_trait]
impl DispatchRepo for MemoryStore {
    async fn take(&self, take: TakeRecord) -> DbResult<TakeOutcome> {
        let mut state = self.state.lock().await;
        let job_status = state.job_mut(take.job_id)?.status;
        if job_status != JobStatus::Waiting {
            return Ok(TakeOutcome::JobUnavailable(job_status));
        }
        match state.workers.get_mut(&take.worker_id) {
            Some(worker)
                if worker.status == WorkerStatus::Checking
                    && worker.disable_requested_at.is_none() =>
            {
                worker.status = WorkerStatus::Building;
                worker.current_job_id = Some(take.job_id);
            }
            _ => return Ok(TakeOutcome::WorkerUnavailable),
        }

        let job = state.job_mut(take.job_id)?;
        job.status = JobStatus::Building;
        job.assigned_worker_id = Some(take.worker_id);
        job.assigned_worker_name = Some(take.worker_name);
        job.assigned_model = take.model_name;
        job.started_at = Some(take.started_at);
        job.spawn_infos.extend(take.infos);
        Ok(TakeOutcome::Taken(job.clone()))
    }

    async fn finish(&self, finish: FinishRecord) -> DbResult<FinishOutcome> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(finish.job_id)?;
        if job.status != JobStatus::Building {
            return Ok(FinishOutcome::JobNotBuilding(job.status));
        }
        if job.assigned_worker_id != Some(finish.worker_id) {
            return Ok(FinishOutcome::NotAssigned);
        }

        match state.workers.get_mut(&finish.worker_id) {
            Some(worker)
                if worker.status == WorkerStatus::Building
                    && worker.current_job_id == Some(finish.job_id) =>
            {
                worker.status = WorkerStatus::Waiting;
                worker.current_job_id = None;
            }
            _ => return Ok(FinishOutcome::NotAssigned),
        }

        let job = state.job_mut(finish.job_id)?;
        job.status = finish.status;
        job.done_at = Some(finish.done_at);
        job.duration_ms = Some(finish.duration_ms);
        job.spawn_infos.push(finish.info);
        Ok(FinishOutcome::Finished(job.clone()))
    }

    async fn release_worker(&self, release: ReleaseWorker) -> DbResult<Option<Released>> {
        let mut state = self.state.lock().await;
        let Some(worker) = state.workers.get_mut(&release.worker_id) else {
            return Ok(None);
        };
        let previous = worker.status;
        if !release.from.contains(&previous) {
            return Ok(None);
        }
        if release.beat_before.is_some_and(|before| worker.last_beat >= before) {
            return Ok(None);
        }

        let job_id = worker.current_job_id.take();
        let worker_name = worker.name.clone();
        worker.status = release.to;
        worker.disable_requested_at = None;

        let mut failed_job = None;
        if let (WorkerStatus::Building, Some(job_id)) = (previous, job_id) {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                if job.status == JobStatus::Building
                    && job.assigned_worker_id == Some(release.worker_id)
                {
                    job.status = JobStatus::Fail;
                    job.done_at = Some(release.at);
                    job.spawn_infos
                        .push(SpawnInfo::now(release.job_message, vec![worker_name]));
                    failed_job = Some(job_id);
                }
            }
        }

        Ok(Some(Released {
            previous,
            failed_job,
        }))
    }
}

/// [`LockService`] over process memory. Only excludes within one process.
#[derive(Default)]
pub struct MemoryLockService {
    /// Key to its lease and expiry. `None` expiry: the TTL overflowed `Instant`.
    locks: Mutex<HashMap<String, (LockLease, Option<Instant>)>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_lock(&self, key: &str, ttl: Duration) -> kiln_core::Result<Option<LockLease>> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        let held = locks
            .get(key)
            .is_some_and(|(_, expires)| expires.is_none_or(|at| at > now));
        if held {
            return Ok(None);
        }
        let lease = LockLease::new(key);
        locks.insert(key.to_string(), (lease.clone(), now.checked_add(ttl)));
        Ok(Some(lease))
    }

    async fn unlock(&self, lease: &LockLease) -> kiln_core::Result<()> {
        let mut locks = self.locks.lock().await;
        if locks.get(&lease.key).is_some_and(|(held, _)| held == lease) {
            locks.remove(&lease.key);
        }
        Ok(())
    }
}
