//! Job DTOs exchanged with the orchestrator API

use serde::{Deserialize, Serialize};

use crate::domain::job::{Job, StateClass};

/// Request to submit a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitJob {
    pub command: String,
    pub gpu_count: u32,
    pub cwd: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub max_runtime_minutes: u32,
}

fn default_priority() -> i32 {
    crate::domain::job::MIN_PRIORITY
}

/// Report from a node agent about a job it was asked to run
///
/// `attempt` echoes [`LaunchRequest::attempt`](crate::dto::agent::LaunchRequest)
/// so a late report from an earlier attempt can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", deny_unknown_fields)]
pub enum JobReport {
    /// The process was spawned
    Started {
        node_id: String,
        #[serde(default)]
        attempt: Option<u32>,
    },

    /// The process could not be spawned
    LaunchFailed {
        node_id: String,
        #[serde(default)]
        attempt: Option<u32>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
    },

    /// The process exited
    Exited {
        node_id: String,
        #[serde(default)]
        attempt: Option<u32>,
        exit_code: i32,
    },
}

impl JobReport {
    /// Node that sent the report
    pub fn node_id(&self) -> &str {
        match self {
            JobReport::Started { node_id, .. }
            | JobReport::LaunchFailed { node_id, .. }
            | JobReport::Exited { node_id, .. } => node_id,
        }
    }

    /// Attempt the report is about, when the agent sent one
    pub fn attempt(&self) -> Option<u32> {
        match self {
            JobReport::Started { attempt, .. }
            | JobReport::LaunchFailed { attempt, .. }
            | JobReport::Exited { attempt, .. } => *attempt,
        }
    }
}

/// Sort direction over `created_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort and pagination options for listing jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    pub state: StateClass,
    /// Case-insensitive substring matched against id, command and owner
    pub q: Option<String>,
    pub sort: SortOrder,
    /// 1-based page number, only applied together with `page_size`
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// One page of a job listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    /// Number of jobs matching the filter before pagination
    pub total: usize,
    pub jobs: Vec<Job>,
}

impl JobQuery {
    /// Filters, sorts and pages a job set.
    ///
    /// Ordering is total: ties on `created_at` fall back to the job id, so the
    /// same job set always yields the same page boundaries.
    pub fn apply(&self, jobs: Vec<Job>) -> JobPage {
        let needle = self
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        let mut matched: Vec<Job> = jobs
            .into_iter()
            .filter(|job| self.state.contains(job.state))
            .filter(|job| match &needle {
                Some(needle) => matches_text(job, needle),
                None => true,
            })
            .collect();

        matched.sort_by(|a, b| {
            let ord = a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id));
            match self.sort {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = matched.len();
        let jobs = match self.page_size {
            Some(size) if size > 0 => {
                let page = self.page.unwrap_or(1).max(1);
                matched
                    .into_iter()
                    .skip((page - 1).saturating_mul(size))
                    .take(size)
                    .collect()
            }
            _ => matched,
        };

        JobPage { total, jobs }
    }
}

fn matches_text(job: &Job, needle: &str) -> bool {
    job.id.to_string().contains(needle)
        || job.command.to_lowercase().contains(needle)
        || job
            .owner_id
            .as_deref()
            .is_some_and(|owner| owner.to_lowercase().contains(needle))
}
