//! Cluster statistics DTO

use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, JobState};
use crate::domain::node::Node;

/// Number of jobs included in `recent_jobs`
pub const RECENT_JOBS: usize = 5;

/// Aggregated view of the cluster for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub running_jobs: usize,
    pub queued_jobs: usize,
    pub active_nodes: usize,
    pub offline_nodes: usize,
    /// Mean of the reported per-node utilization, rounded
    pub gpu_utilization: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub recent_jobs: Vec<Job>,
}

impl ClusterStats {
    pub fn compute(jobs: &[Job], nodes: &[Node]) -> Self {
        let running_jobs = jobs.iter().filter(|j| j.state == JobState::Running).count();
        let queued_jobs = jobs.iter().filter(|j| j.state == JobState::Queued).count();

        let active_nodes = nodes.iter().filter(|n| n.status.is_alive()).count();
        let offline_nodes = nodes.len() - active_nodes;

        let gpu_utilization = if nodes.is_empty() {
            0
        } else {
            let total: f64 = nodes.iter().map(|n| n.gpu_utilization.unwrap_or(0.0)).sum();
            (total / nodes.len() as f64).round() as u32
        };

        let mut recent_jobs = jobs.to_vec();
        recent_jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        recent_jobs.truncate(RECENT_JOBS);

        ClusterStats {
            running_jobs,
            queued_jobs,
            active_nodes,
            offline_nodes,
            gpu_utilization,
            memory_used_mb: nodes.iter().filter_map(|n| n.memory_used_mb).sum(),
            memory_total_mb: nodes.iter().filter_map(|n| n.memory_total_mb).sum(),
            recent_jobs,
        }
    }
}
