//! Booking: a hatchery's advisory reservation of a waiting job.

use chrono::Utc;
use kiln_core::auth::Caller;
use kiln_core::hatchery::Hatchery;
use kiln_core::job::{Booking, Job, JobStatus};
use kiln_core::{Error, JobId, Result};
use tracing::{debug, info};

use crate::context::DispatchContext;

impl DispatchContext {
    async fn live_hatchery(&self, caller: &Caller) -> Result<Hatchery> {
        let hatchery_id = caller.hatchery_id()?;
        let hatchery = match self.store.hatcheries.get(hatchery_id).await {
            Ok(h) => h,
            Err(kiln_db::DbError::NotFound(_)) => {
                return Err(Error::Forbidden("hatchery is not registered".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !hatchery.is_alive(Utc::now(), self.hatchery_timeout()) {
            return Err(Error::Forbidden(format!(
                "hatchery {} has not sent a heartbeat recently",
                hatchery.name
            )));
        }
        Ok(hatchery)
    }

    /// Reserve a waiting job for the calling hatchery.
    ///
    /// Losing the race to another hatchery is an ordinary `Conflict`.
    pub async fn book(&self, caller: &Caller, job_id: JobId) -> Result<Job> {
        let hatchery = self.live_hatchery(caller).await?;
        let job = self.store.jobs.get(job_id).await?;
        self.ensure_visible(caller, job.group_id)?;

        if job.status != JobStatus::Waiting {
            return Err(Error::Conflict(format!(
                "job {} is {}, not Waiting",
                job.id, job.status
            )));
        }

        let booking = Booking {
            hatchery_id: hatchery.id,
            hatchery_name: hatchery.name.clone(),
            booked_at: Utc::now(),
        };
        let Some(job) = self
            .store
            .jobs
            .book(job_id, booking, self.booking_ttl())
            .await?
        else {
            debug!(job_id = %job_id, hatchery = %hatchery.name, "Booking lost");
            return Err(Error::Conflict(format!(
                "job {} is already booked or no longer waiting",
                job_id
            )));
        };

        info!(job_id = %job.id, hatchery = %hatchery.name, "Job booked");
        Ok(job)
    }

    /// Give back a reservation the calling hatchery cannot honor.
    pub async fn release_booking(&self, caller: &Caller, job_id: JobId) -> Result<()> {
        let hatchery_id = caller.hatchery_id()?;
        let job = self.store.jobs.get(job_id).await?;
        self.ensure_visible(caller, job.group_id)?;

        if !self.store.jobs.release_booking(job_id, hatchery_id).await? {
            return Err(Error::Conflict(format!(
                "job {} is not booked by this hatchery",
                job_id
            )));
        }
        info!(job_id = %job_id, hatchery_id = %hatchery_id, "Booking released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use futures::future::join_all;
    use kiln_config::SystemConfig;

    #[tokio::test]
    async fn test_second_hatchery_gets_conflict() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (h1, reg1) = fx.hatchery("h1").await;
        let (h2, _) = fx.hatchery("h2").await;

        let booked = fx.ctx.book(&h1, job.id).await.unwrap();
        assert_eq!(booked.status, JobStatus::Waiting);
        assert_eq!(booked.booked_by.unwrap().hatchery_id, reg1.hatchery.id);

        let err = fx.ctx.book(&h2, job.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_at_most_one_book() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let mut callers = Vec::new();
        for i in 0..8 {
            callers.push(fx.hatchery(&format!("h{}", i)).await.0);
        }

        let results = join_all(callers.iter().map(|c| fx.ctx.book(c, job.id))).await;
        let won = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Conflict(_))))
            .count();
        assert_eq!(won, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_expired_booking_does_not_block() {
        let mut config = SystemConfig::default();
        config.booking.ttl = std::time::Duration::ZERO;
        let fx = Fixture::with_config(config).await;
        let job = fx.job().await;
        let (h1, _) = fx.hatchery("h1").await;
        let (h2, reg2) = fx.hatchery("h2").await;

        fx.ctx.book(&h1, job.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let booked = fx.ctx.book(&h2, job.id).await.unwrap();
        assert_eq!(booked.booked_by.unwrap().hatchery_id, reg2.hatchery.id);
    }

    #[tokio::test]
    async fn test_book_requires_hatchery_of_group() {
        let fx = Fixture::new().await;
        let other = Fixture::with_store(fx.ctx.clone()).await;
        let job = other.job().await;
        let (h1, _) = fx.hatchery("h1").await;
        let (w1, _) = fx.worker("w1").await;

        assert!(matches!(fx.ctx.book(&h1, job.id).await, Err(Error::Forbidden(_))));
        assert!(matches!(fx.ctx.book(&w1, job.id).await, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_silent_hatchery_cannot_book() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (h1, reg) = fx.hatchery("h1").await;
        fx.ctx
            .store
            .hatcheries
            .heartbeat(reg.hatchery.id, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert!(matches!(fx.ctx.book(&h1, job.id).await, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_release_booking() {
        let fx = Fixture::new().await;
        let job = fx.job().await;
        let (h1, _) = fx.hatchery("h1").await;
        let (h2, _) = fx.hatchery("h2").await;

        fx.ctx.book(&h1, job.id).await.unwrap();
        assert!(matches!(
            fx.ctx.release_booking(&h2, job.id).await,
            Err(Error::Conflict(_))
        ));
        fx.ctx.release_booking(&h1, job.id).await.unwrap();
        fx.ctx.book(&h2, job.id).await.unwrap();
    }
}
