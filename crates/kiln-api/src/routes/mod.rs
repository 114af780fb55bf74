//! API routes.

pub mod hatchery;
pub mod health;
pub mod queue;
pub mod worker;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/queue", queue::router())
        .nest("/worker", worker::router())
        .nest("/hatchery", hatchery::router())
        .merge(health::router())
        .with_state(state)
}
