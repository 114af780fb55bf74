//! Core domain types and traits for the Kiln job dispatch control plane.
//!
//! This crate contains:
//! - Typed resource identifiers
//! - The error taxonomy shared by every layer
//! - Job, worker, hatchery and worker model types
//! - The worker status state machine
//! - Spawn info messages (the job audit trail)
//! - Caller identities and authorization scopes
//! - Lock and secret resolution abstractions

pub mod auth;
pub mod error;
pub mod hatchery;
pub mod id;
pub mod job;
pub mod lock;
pub mod model;
pub mod secret;
pub mod spawn;
pub mod worker;

pub use error::{Error, Result};
pub use id::{ConsumerId, GroupId, HatcheryId, JobId, ModelId, WorkerId};
