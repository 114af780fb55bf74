//! Repository traits and implementations.

pub mod consumer;
pub mod dispatch;
pub mod hatchery;
pub mod job;
pub mod lock;
pub mod model;
pub mod variable;
pub mod worker;

pub use consumer::{ConsumerRepo, PgConsumerRepo};
pub use dispatch::{
    DispatchRepo, FinishOutcome, FinishRecord, PgDispatchRepo, ReleaseWorker, Released,
    TakeOutcome, TakeRecord,
};
pub use hatchery::{HatcheryRepo, PgHatcheryRepo};
pub use job::{JobRepo, PgJobRepo};
pub use lock::PgLockService;
pub use model::{ModelRepo, PgModelRepo};
pub use variable::{NewVariable, PgVariableRepo, VariableRepo};
pub use worker::{PgWorkerRepo, WorkerRepo};
