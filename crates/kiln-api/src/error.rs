//! API error handling.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// API error type. Every variant renders as `{"error": ..., "code": ...}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    WrongStatus(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            ApiError::WrongStatus(msg) => (StatusCode::FORBIDDEN, "wrong_status", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl From<kiln_core::Error> for ApiError {
    fn from(err: kiln_core::Error) -> Self {
        match err {
            kiln_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            kiln_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            kiln_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            kiln_core::Error::Forbidden(msg) => ApiError::Forbidden(msg),
            kiln_core::Error::WrongStatus(msg) => ApiError::WrongStatus(msg),
            kiln_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            kiln_core::Error::Unavailable(msg) => ApiError::Unavailable(msg),
            kiln_core::Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<kiln_db::DbError> for ApiError {
    fn from(err: kiln_db::DbError) -> Self {
        kiln_core::Error::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
