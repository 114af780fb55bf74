//! Application state.

use kiln_scheduler::DispatchContext;
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: DispatchContext,
    /// Present when running against PostgreSQL; used by readiness checks.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(ctx: DispatchContext, pool: Option<PgPool>) -> Self {
        Self { ctx, pool }
    }
}
