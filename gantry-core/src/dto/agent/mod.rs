//! Agent DTOs
//!
//! Payloads the orchestrator sends to node agents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::Job;

/// Instruction to start a job's process on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub job_id: Uuid,
    pub command: String,
    pub cwd: String,
    pub gpu_count: u32,
    pub max_runtime_minutes: u32,
    /// 0 for the first attempt, incremented on every retry
    pub attempt: u32,
}

impl From<&Job> for LaunchRequest {
    fn from(job: &Job) -> Self {
        LaunchRequest {
            job_id: job.id,
            command: job.command.clone(),
            cwd: job.cwd.clone(),
            gpu_count: job.gpu_count,
            max_runtime_minutes: job.max_runtime_minutes,
            attempt: job.retry_count,
        }
    }
}
