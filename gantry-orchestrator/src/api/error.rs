//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::registry::RegistryError;
use crate::repository::StoreError;
use crate::service::{JobError, LogError};

/// API error type
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    PayloadTooLarge(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => {
                let body = Json(serde_json::json!({ "error": "missing or invalid bearer token" }));
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    body,
                )
                    .into_response();
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            StoreError::Conflict { .. } | StoreError::Duplicate(_) => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::Database(err) => ApiError::DatabaseError(err),
            StoreError::IllegalTransition { .. } | StoreError::Invariant(_) => {
                ApiError::InternalError(err.to_string())
            }
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            JobError::ValidationError(msg) => ApiError::BadRequest(msg),
            JobError::InvalidState(msg) => ApiError::Conflict(msg),
            JobError::Store(err) => err.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ApiError::NotFound(format!("Node {} not found", id)),
            RegistryError::Validation(msg) => ApiError::BadRequest(msg),
            RegistryError::InUse(_) => ApiError::Conflict(err.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::NotFound(id) => ApiError::NotFound(format!("No logs for job {}", id)),
            LogError::ChunkTooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            LogError::StreamInterrupted(_) => ApiError::InternalError(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
