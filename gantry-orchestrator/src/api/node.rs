//! Node API Handlers
//!
//! Agent-facing registration and heartbeat, plus the node listing.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use gantry_core::domain::node::Node;
use gantry_core::dto::node::NodeHeartbeat;

use super::AppState;
use crate::api::error::ApiResult;

/// GET /v1/nodes
/// List all registered nodes, ordered by id
pub async fn list_nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    tracing::debug!("Listing nodes");
    Json(state.registry.list())
}

/// POST /v1/nodes/{id}/heartbeat
/// Register a node or refresh its liveness and resource stats
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(hb): Json<NodeHeartbeat>,
) -> ApiResult<Json<Node>> {
    tracing::debug!("Heartbeat from node {}", id);

    let before = state.registry.get(&id).ok();
    let node = state.registry.heartbeat(&id, hb)?;

    // a new or revived node may fit jobs that are waiting
    if before.is_none_or(|prev| !prev.status.is_alive()) {
        tracing::info!("Node {} is {} with {} GPUs", node.id, node.status, node.gpu_count);
        state.trigger.notify_one();
    }

    Ok(Json(node))
}

/// DELETE /v1/nodes/{id}
/// Forget a node; refused while a job holds GPUs on it
pub async fn remove_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Removing node {}", id);

    state.registry.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
