//! Cluster Statistics API Handler

use axum::{Json, extract::State};
use gantry_core::dto::stats::ClusterStats;

use super::AppState;
use crate::api::error::ApiResult;

/// GET /v1/stats
/// Job and node aggregates for dashboards
pub async fn cluster_stats(State(state): State<AppState>) -> ApiResult<Json<ClusterStats>> {
    let jobs = state.jobs.list_all().await?;
    let nodes = state.registry.list();

    Ok(Json(ClusterStats::compute(&jobs, &nodes)))
}
