//! Health Check API Handler
//!
//! Unauthenticated liveness check.

use axum::{http::StatusCode, response::IntoResponse};

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
