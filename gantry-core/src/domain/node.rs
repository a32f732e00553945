//! Node domain model
//!
//! Represents a compute host that runs jobs through its node agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered compute host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier reported by the node agent
    pub id: String,

    /// Address the agent listens on (host:port or full URL)
    pub addr: String,

    pub agent_version: String,

    /// Current status of the node
    pub status: NodeStatus,

    /// Total GPUs on the host
    pub gpu_count: u32,

    /// GPUs not held by any reservation
    pub gpu_free: u32,

    /// Observed utilization in percent, advisory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total_mb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<u64>,

    /// Last time this node sent a heartbeat
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    /// Whether the scheduler may place work here
    pub fn is_schedulable(&self) -> bool {
        self.status.is_alive() && self.gpu_free > 0
    }
}

/// Status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Heartbeating but reporting no GPUs
    Up,

    /// Heartbeating with free GPUs
    Ready,

    /// Heartbeating, every GPU reserved
    Busy,

    /// Heartbeat older than the liveness threshold
    Offline,

    /// Heartbeat older than the down threshold
    Down,
}

impl NodeStatus {
    /// Derives the status of a node whose heartbeat is recent
    pub fn live(gpu_count: u32, gpu_free: u32) -> Self {
        if gpu_count == 0 {
            NodeStatus::Up
        } else if gpu_free == 0 {
            NodeStatus::Busy
        } else {
            NodeStatus::Ready
        }
    }

    pub fn is_alive(self) -> bool {
        matches!(self, NodeStatus::Up | NodeStatus::Ready | NodeStatus::Busy)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Up => write!(f, "UP"),
            NodeStatus::Ready => write!(f, "READY"),
            NodeStatus::Busy => write!(f, "BUSY"),
            NodeStatus::Offline => write!(f, "OFFLINE"),
            NodeStatus::Down => write!(f, "DOWN"),
        }
    }
}
