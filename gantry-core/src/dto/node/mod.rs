//! Node DTOs
//!
//! Data transfer objects for node agent heartbeats.

use serde::{Deserialize, Serialize};

/// Periodic liveness and resource report sent by a node agent
///
/// The first heartbeat of an unknown node registers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeHeartbeat {
    /// Address the orchestrator uses to reach the agent
    pub addr: String,

    pub agent_version: String,

    /// Total GPUs on the host
    pub gpu_count: u32,

    #[serde(default)]
    pub gpu_utilization: Option<f64>,

    #[serde(default)]
    pub memory_total_mb: Option<u64>,

    #[serde(default)]
    pub memory_used_mb: Option<u64>,
}
