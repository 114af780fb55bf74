//! The reaper: two background sweeps that retire silent workers.
//!
//! The dead-worker sweep disables workers whose heartbeat is older than the
//! timeout and releases stale bookings. The delete sweep removes Disabled
//! workers with their credentials and promotes deferred disable requests.
//! Both take a per-worker lock so replicas never process the same worker
//! at once, and both treat the next tick as the retry for anything that
//! failed.

use chrono::{DateTime, Utc};
use kiln_core::lock::worker_lock_key;
use kiln_core::spawn::MessageId;
use kiln_core::worker::{Worker, WorkerEvent, WorkerStatus};
use kiln_core::Result;
use kiln_db::ReleaseWorker;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{DispatchContext, to_chrono};

const REAPABLE: [WorkerStatus; 3] = [
    WorkerStatus::Checking,
    WorkerStatus::Waiting,
    WorkerStatus::Building,
];

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Workers disabled (dead sweep) or deleted (delete sweep).
    pub processed: usize,
    /// Workers locked by another replica or changed since selection.
    pub skipped: usize,
    pub failed: usize,
    pub bookings_released: usize,
    pub disables_promoted: usize,
}

pub struct Reaper {
    ctx: DispatchContext,
}

impl Reaper {
    pub fn new(ctx: DispatchContext) -> Self {
        Self { ctx }
    }

    /// Run both sweeps until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting reaper");
        tokio::join!(self.dead_loop(&cancel), self.delete_loop(&cancel));
        info!("Reaper stopped");
    }

    async fn dead_loop(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.reaper.dead_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.dead_sweep().await;
                    debug!(?stats, "Dead-worker sweep done");
                }
            }
        }
    }

    async fn delete_loop(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.ctx.config.reaper.delete_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.delete_sweep().await;
                    debug!(?stats, "Delete sweep done");
                }
            }
        }
    }

    /// Run `f` on `worker` under its reaper lock. `Ok(false)` when the lock
    /// is held elsewhere.
    async fn with_lock<F, Fut>(&self, worker: &Worker, f: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let key = worker_lock_key(worker.id);
        let locks = &self.ctx.store.locks;
        let Some(lease) = locks.try_lock(&key, self.ctx.config.reaper.lock_ttl).await? else {
            debug!(worker = %worker.name, "Worker locked by another reaper");
            return Ok(false);
        };
        let result = f().await;
        if let Err(e) = locks.unlock(&lease).await {
            warn!(worker = %worker.name, error = %e, "Cannot release reaper lock");
        }
        result
    }

    /// Disable every worker silent for longer than the heartbeat timeout,
    /// then release expired bookings.
    pub async fn dead_sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        // A timeout reaching past the start of time means nothing is old enough.
        match now.checked_sub_signed(self.ctx.worker_timeout()) {
            Some(beat_before) => self.reap_dead(beat_before, now, &mut stats).await,
            None => debug!("Heartbeat timeout exceeds the clock range, no worker is dead"),
        }

        if let Some(booked_before) = now.checked_sub_signed(self.ctx.booking_ttl()) {
            match self.ctx.store.jobs.release_stale_bookings(booked_before).await {
                Ok(released) => {
                    for job in &released {
                        info!(job_id = %job.id, "Stale booking released");
                    }
                    stats.bookings_released = released.len();
                }
                Err(e) => warn!(error = %e, "Cannot release stale bookings"),
            }
        }

        stats
    }

    async fn reap_dead(&self, beat_before: DateTime<Utc>, now: DateTime<Utc>, stats: &mut SweepStats) {
        match self.ctx.store.workers.list_dead(&REAPABLE, beat_before).await {
            Ok(dead) => {
                for worker in dead {
                    match self.with_lock(&worker, || self.reap(&worker, beat_before, now)).await {
                        Ok(true) => stats.processed += 1,
                        Ok(false) => stats.skipped += 1,
                        Err(e) => {
                            stats.failed += 1;
                            warn!(worker = %worker.name, error = %e, "Cannot disable dead worker");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Cannot list dead workers"),
        }
    }

    async fn reap(&self, worker: &Worker, beat_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        worker.status.on(WorkerEvent::Reap)?;
        let released = self
            .ctx
            .store
            .dispatch
            .release_worker(ReleaseWorker {
                worker_id: worker.id,
                from: REAPABLE.to_vec(),
                to: WorkerStatus::Disabled,
                beat_before: Some(beat_before),
                job_message: MessageId::WorkerLost,
                at: now,
            })
            .await?;

        let Some(released) = released else {
            return Ok(false);
        };
        info!(
            worker = %worker.name,
            previous = %released.previous,
            last_beat = %worker.last_beat,
            job_id = ?released.failed_job,
            "Disabled dead worker"
        );
        Ok(true)
    }

    /// Delete Disabled workers and their credentials, then promote due
    /// deferred disables.
    pub async fn delete_sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let workers = &self.ctx.store.workers;

        match workers.list_by_status(WorkerStatus::Disabled).await {
            Ok(disabled) => {
                for worker in disabled {
                    let deleted = self
                        .with_lock(&worker, || async {
                            workers
                                .delete_disabled(worker.id)
                                .await
                                .map_err(kiln_core::Error::from)
                        })
                        .await;
                    match deleted {
                        Ok(true) => {
                            stats.processed += 1;
                            info!(worker = %worker.name, "Deleted disabled worker");
                        }
                        Ok(false) => stats.skipped += 1,
                        Err(e) => {
                            stats.failed += 1;
                            warn!(worker = %worker.name, error = %e, "Cannot delete disabled worker");
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Cannot list disabled workers"),
        }

        match self.promote_deferred_disables(Utc::now()).await {
            Ok(n) => stats.disables_promoted = n,
            Err(e) => warn!(error = %e, "Cannot promote deferred disables"),
        }

        stats
    }

    async fn promote_deferred_disables(&self, now: DateTime<Utc>) -> Result<usize> {
        let workers = &self.ctx.store.workers;
        let deadline = to_chrono(self.ctx.config.reaper.disable_defer_timeout);
        let mut promoted = 0;

        for worker in workers.list_disable_requested().await? {
            let Some(requested_at) = worker.disable_requested_at else {
                continue;
            };
            let overdue = now - requested_at > deadline;
            let from = match worker.status {
                WorkerStatus::Waiting => WorkerStatus::Waiting,
                WorkerStatus::Checking if overdue => {
                    warn!(
                        worker = %worker.name,
                        requested_at = %requested_at,
                        "Worker still checking past the disable deadline, disabling anyway"
                    );
                    WorkerStatus::Checking
                }
                _ => continue,
            };
            if workers.set_status(worker.id, from, WorkerStatus::Disabled).await? {
                info!(worker = %worker.name, "Deferred disable applied");
                promoted += 1;
            }
        }

        Ok(promoted)
    }
}
