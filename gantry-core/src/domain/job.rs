//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest accepted job priority
pub const MIN_PRIORITY: i32 = 1;

/// Highest accepted job priority
pub const MAX_PRIORITY: i32 = 10;

/// Longest runtime limit a job may request, 30 days
pub const MAX_RUNTIME_MINUTES: u32 = 30 * 24 * 60;

/// Default number of automatic re-queues after a launch or run failure
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Exit code recorded when a job exceeds its `max_runtime_minutes`
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when the agent could not launch the process and gave no code
pub const LAUNCH_FAILED_EXIT_CODE: i32 = 127;

/// Exit code recorded when no node in the cluster can ever fit the job
pub const UNSCHEDULABLE_EXIT_CODE: i32 = -1;

/// A submitted unit of GPU work
///
/// Structure shared between the orchestrator (persists, schedules) and its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub gpu_count: u32,
    pub priority: i32,
    pub cwd: String,
    pub max_runtime_minutes: u32,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub state: JobState,
    /// Node holding this job's reservation, present only while STARTING or RUNNING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Checks the structural invariants every stored job must satisfy.
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self, retry_limit: u32) -> Result<(), String> {
        if self.gpu_count < 1 {
            return Err(format!("job {} has gpu_count 0", self.id));
        }
        if self.retry_count > retry_limit {
            return Err(format!(
                "job {} has retry_count {} above limit {}",
                self.id, self.retry_count, retry_limit
            ));
        }
        let wants_exit_code = matches!(self.state, JobState::Succeeded | JobState::Failed);
        if wants_exit_code != self.exit_code.is_some() {
            return Err(format!(
                "job {} in state {} has exit_code {:?}",
                self.id, self.state, self.exit_code
            ));
        }
        if self.state.holds_assignment() != self.node_id.is_some() {
            return Err(format!(
                "job {} in state {} has node assignment {:?}",
                self.id, self.state, self.node_id
            ));
        }

        let ordered = [
            Some(self.created_at),
            self.queued_at,
            self.started_at,
            self.finished_at,
        ];
        let mut last = self.created_at;
        for ts in ordered.into_iter().flatten() {
            if ts < last {
                return Err(format!("job {} has out-of-order timestamps", self.id));
            }
            last = ts;
        }

        Ok(())
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Starting,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Lost,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Queued,
        JobState::Starting,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Canceled,
        JobState::Lost,
    ];

    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled | JobState::Lost
        )
    }

    /// Whether a job in this state owns a node reservation
    pub fn holds_assignment(self) -> bool {
        matches!(self, JobState::Starting | JobState::Running)
    }

    pub fn class(self) -> StateClass {
        if self.is_terminal() {
            StateClass::Done
        } else {
            StateClass::Active
        }
    }

    /// Edges of the job state machine.
    ///
    /// Besides the user-visible lifecycle this includes the re-queue edges
    /// (failed dispatch, retry) and the unschedulable failure of a queued job.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Starting)
                | (Queued, Canceled)
                | (Queued, Failed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Canceled)
                | (Starting, Lost)
                | (Starting, Queued)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Lost)
                | (Running, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Starting => "STARTING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Lost => "LOST",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Coarse grouping of states used by list filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateClass {
    #[default]
    All,
    /// QUEUED, STARTING, RUNNING
    Active,
    /// SUCCEEDED, FAILED, CANCELED, LOST
    Done,
}

impl StateClass {
    pub fn contains(self, state: JobState) -> bool {
        match self {
            StateClass::All => true,
            other => state.class() == other,
        }
    }
}

/// One recorded state change of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub at: DateTime<Utc>,
    /// Absent for the submission event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<JobState>,
    pub to: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub retry_count: u32,
}
