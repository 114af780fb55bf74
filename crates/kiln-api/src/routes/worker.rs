//! Worker endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::WorkerId;
use kiln_core::worker::{RegistrationForm, Worker};
use kiln_scheduler::RegisteredWorker;

use crate::AppState;
use crate::auth::{Auth, Body, PathId};
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers).post(register))
        .route("/checking", post(checking))
        .route("/waiting", post(waiting))
        .route("/refresh", post(refresh))
        .route("/unregister", post(unregister))
        .route("/{id}/disable", post(disable))
}

/// Registration authenticates with the group token inside the form.
async fn register(
    State(state): State<AppState>,
    Body(form): Body<RegistrationForm>,
) -> Result<(StatusCode, Json<RegisteredWorker>), ApiError> {
    let registered = state.ctx.register_worker(form).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn list_workers(
    State(state): State<AppState>,
    Auth(caller): Auth,
) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(state.ctx.list_workers(&caller).await?))
}

async fn checking(
    State(state): State<AppState>,
    Auth(caller): Auth,
) -> Result<Json<Worker>, ApiError> {
    Ok(Json(state.ctx.request_checking(&caller).await?))
}

async fn waiting(
    State(state): State<AppState>,
    Auth(caller): Auth,
) -> Result<Json<Worker>, ApiError> {
    Ok(Json(state.ctx.request_waiting(&caller).await?))
}

async fn refresh(State(state): State<AppState>, Auth(caller): Auth) -> Result<StatusCode, ApiError> {
    state.ctx.refresh_worker(&caller).await?;
    Ok(StatusCode::OK)
}

async fn unregister(
    State(state): State<AppState>,
    Auth(caller): Auth,
) -> Result<StatusCode, ApiError> {
    state.ctx.unregister_worker(&caller).await?;
    Ok(StatusCode::OK)
}

async fn disable(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<WorkerId>,
) -> Result<Json<Worker>, ApiError> {
    Ok(Json(state.ctx.disable_worker(&caller, id).await?))
}
