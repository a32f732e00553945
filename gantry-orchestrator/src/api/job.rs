//! Job API Handlers
//!
//! HTTP endpoints for job submission, lifecycle and logs.

use axum::{
    Extension, Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{self, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use gantry_core::domain::identity::Identity;
use gantry_core::domain::job::{Job, JobEvent, JobState};
use gantry_core::dto::job::{JobQuery, JobReport, SubmitJob};
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::AppState;
use crate::api::error::{ApiError, ApiResult};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Header carrying the number of jobs matching a listing filter
pub const TOTAL_COUNT_HEADER: &str = "x-total-count";

// =============================================================================
// Job Endpoints
// =============================================================================

/// GET /v1/jobs
/// List jobs, optionally filtered, sorted and paged
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Response> {
    tracing::debug!("Listing jobs: {:?}", query);

    let page = state.jobs.list(&query).await?;

    Ok((
        [(TOTAL_COUNT_HEADER, page.total.to_string())],
        Json(page.jobs),
    )
        .into_response())
}

/// POST /v1/jobs
/// Submit a new job on behalf of the caller
pub async fn submit_job(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SubmitJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    tracing::info!(
        "Submitting job for {} ({} GPUs, priority {})",
        identity.id,
        req.gpu_count,
        req.priority
    );

    let job = state.jobs.submit(req, Some(&identity)).await?;
    state.trigger.notify_one();

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /v1/jobs/{id}
/// Get job details by ID
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = state.jobs.get(id).await?;
    Ok(Json(job))
}

/// POST /v1/jobs/{id}/cancel
/// Cancel a job; 202 while the node has yet to confirm termination
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    tracing::info!("Canceling job: {}", id);

    let job = state.monitor.cancel(id).await?;
    let status = if job.state == JobState::Canceled {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((status, Json(job)))
}

/// GET /v1/jobs/{id}/events
/// Lifecycle transitions of a job, oldest first
pub async fn list_job_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<JobEvent>>> {
    tracing::debug!("Listing events of job: {}", id);

    let events = state.jobs.events(id).await?;
    Ok(Json(events))
}

/// POST /v1/jobs/{id}/report
/// Node agent report about a job it runs
pub async fn report_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<JobReport>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Report for job {}: {:?}", id, report);

    state.monitor.report(id, report).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Log Endpoints
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub follow: bool,
}

/// GET /v1/jobs/{id}/logs
/// Captured output as plain text; `?follow=true` streams it until the job ends
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Response> {
    if !query.follow {
        tracing::debug!("Getting logs for job: {}", id);
        let text = state.logs.fetch(id)?;
        return Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], text).into_response());
    }

    tracing::debug!("Following logs for job: {}", id);

    // a job that ended without output never had its log closed by a transition
    let job = state.jobs.get(id).await?;
    if job.state.is_terminal() {
        state.logs.close(id, job.state == JobState::Lost);
    }

    let stream = state
        .logs
        .follow(id)
        .take_until(state.shutting_down())
        .map(|chunk| chunk.map(Bytes::from));

    http::Response::builder()
        .header(header::CONTENT_TYPE, TEXT_PLAIN)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::InternalError(e.to_string()))
}

/// POST /v1/jobs/{id}/logs
/// Append a chunk of captured output
pub async fn append_job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: String,
) -> ApiResult<StatusCode> {
    tracing::debug!("Appending {} bytes of logs for job: {}", body.len(), id);

    // rejects unknown jobs before buffering anything
    state.jobs.get(id).await?;
    state.logs.append(id, body)?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Event Feed
// =============================================================================

/// GET /v1/events
/// Live job state changes as server-sent events, until the server shuts down
pub async fn event_feed(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!("Event feed subscriber connected");

    let rx = state.jobs.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().event("job").json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), rx)),
                    Err(e) => tracing::error!("Failed to encode job event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event feed subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream.take_until(state.shutting_down())).keep_alive(KeepAlive::default())
}
