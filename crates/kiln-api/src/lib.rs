//! HTTP API server for the Kiln control plane.
//!
//! Exposes the job queue, worker and hatchery endpoints on top of
//! `kiln-scheduler`.

pub mod auth;
pub mod error;
pub mod routes;
pub mod shutdown;
pub mod state;

pub use state::AppState;
