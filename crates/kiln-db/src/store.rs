//! The set of repositories a running control plane works against.

use kiln_core::lock::LockService;
use sqlx::PgPool;
use std::sync::Arc;

use crate::memory::{MemoryLockService, MemoryStore};
use crate::repo::{
    ConsumerRepo, DispatchRepo, HatcheryRepo, JobRepo, ModelRepo, PgConsumerRepo,
    PgDispatchRepo, PgHatcheryRepo, PgJobRepo, PgLockService, PgModelRepo, PgVariableRepo,
    PgWorkerRepo, VariableRepo, WorkerRepo,
};

#[derive(Clone)]
pub struct Store {
    pub jobs: Arc<dyn JobRepo>,
    pub workers: Arc<dyn WorkerRepo>,
    pub hatcheries: Arc<dyn HatcheryRepo>,
    pub consumers: Arc<dyn ConsumerRepo>,
    pub models: Arc<dyn ModelRepo>,
    pub variables: Arc<dyn VariableRepo>,
    pub dispatch: Arc<dyn DispatchRepo>,
    pub locks: Arc<dyn LockService>,
}

impl Store {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            workers: Arc::new(PgWorkerRepo::new(pool.clone())),
            hatcheries: Arc::new(PgHatcheryRepo::new(pool.clone())),
            consumers: Arc::new(PgConsumerRepo::new(pool.clone())),
            models: Arc::new(PgModelRepo::new(pool.clone())),
            variables: Arc::new(PgVariableRepo::new(pool.clone())),
            dispatch: Arc::new(PgDispatchRepo::new(pool.clone())),
            locks: Arc::new(PgLockService::new(pool)),
        }
    }

    /// One shared [`MemoryStore`] behind every repository.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            jobs: store.clone(),
            workers: store.clone(),
            hatcheries: store.clone(),
            consumers: store.clone(),
            models: store.clone(),
            variables: store.clone(),
            dispatch: store,
            locks: Arc::new(MemoryLockService::new()),
        }
    }
}
