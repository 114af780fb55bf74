//! Hatchery endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{post, put};
use axum::{Json, Router};
use kiln_core::HatcheryId;
use kiln_core::hatchery::{Hatchery, HatcheryRegistration, RegisteredHatchery};

use crate::AppState;
use crate::auth::{Auth, Body, PathId};
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(register))
        .route("/{id}", put(heartbeat))
}

async fn register(
    State(state): State<AppState>,
    Body(registration): Body<HatcheryRegistration>,
) -> Result<(StatusCode, Json<RegisteredHatchery>), ApiError> {
    let registered = state.ctx.register_hatchery(registration).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn heartbeat(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<HatcheryId>,
) -> Result<Json<Hatchery>, ApiError> {
    Ok(Json(state.ctx.hatchery_heartbeat(&caller, id).await?))
}
