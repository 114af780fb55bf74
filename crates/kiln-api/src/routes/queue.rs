//! Job queue endpoints: listing, booking, taking and results.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::JobId;
use kiln_core::job::{Job, JobResult, NewJob};
use kiln_core::spawn::SpawnInfoRequest;
use kiln_scheduler::{JobDetailWithSecrets, RequirementsError, TakeRequest};

use crate::AppState;
use crate::auth::{Auth, Body, PathId};
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_queue).post(enqueue))
        .route("/requirements/errors", post(requirements_error))
        .route("/{id}/book", post(book).delete(release_booking))
        .route("/{id}/take", post(take))
        .route("/{id}/spawn/infos", post(spawn_infos))
        .route("/{id}/infos", get(job_infos))
        .route("/{id}/result", post(result))
}

async fn list_queue(
    State(state): State<AppState>,
    Auth(caller): Auth,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.ctx.list_waiting(&caller).await?))
}

async fn enqueue(
    State(state): State<AppState>,
    Auth(caller): Auth,
    Body(new): Body<NewJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.ctx.enqueue(&caller, new).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn requirements_error(
    State(state): State<AppState>,
    Auth(caller): Auth,
    Body(report): Body<RequirementsError>,
) -> Result<StatusCode, ApiError> {
    state.ctx.report_requirements_error(&caller, report).await?;
    Ok(StatusCode::OK)
}

async fn book(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<JobId>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.ctx.book(&caller, id).await?))
}

async fn release_booking(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<JobId>,
) -> Result<StatusCode, ApiError> {
    state.ctx.release_booking(&caller, id).await?;
    Ok(StatusCode::OK)
}

async fn take(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<JobId>,
    Body(request): Body<TakeRequest>,
) -> Result<Json<JobDetailWithSecrets>, ApiError> {
    Ok(Json(state.ctx.take(&caller, id, request).await?))
}

async fn spawn_infos(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<JobId>,
    Body(entries): Body<Vec<SpawnInfoRequest>>,
) -> Result<StatusCode, ApiError> {
    state.ctx.append_spawn_infos(&caller, id, entries).await?;
    Ok(StatusCode::OK)
}

async fn job_infos(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<JobId>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.ctx.job_detail(&caller, id).await?))
}

async fn result(
    State(state): State<AppState>,
    Auth(caller): Auth,
    PathId(id): PathId<JobId>,
    Body(result): Body<JobResult>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.ctx.send_result(&caller, id, result).await?))
}
