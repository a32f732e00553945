//! Repository Module
//!
//! Persistence layer for jobs and their event history.
//!
//! `JobStore` is the storage seam: the in-memory store serves single-process
//! deployments and tests, the Postgres store serves durable deployments. Both
//! share the transition rules in [`Transition::apply`], so a compare-and-swap
//! behaves identically whichever store is behind it.

pub mod job;
pub mod memory;

// Re-export for convenience
pub use job::PgJobStore;
pub use memory::MemoryJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::job::{Job, JobEvent, JobState};
use thiserror::Error;
use uuid::Uuid;

/// Store error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The job was not in the expected state when the swap was attempted
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: JobState,
        actual: JobState,
    },

    #[error("illegal transition {from} -> {to} for job {id}")]
    IllegalTransition { id: Uuid, from: JobState, to: JobState },

    #[error("job invariant violated: {0}")]
    Invariant(String),

    #[error("duplicate job id {0}")]
    Duplicate(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Authoritative record of jobs and their state-machine history
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly submitted job and record its submission event
    async fn insert(&self, job: Job) -> Result<JobEvent>;

    async fn get(&self, id: Uuid) -> Result<Job>;

    /// Every job, in no particular order
    async fn list(&self) -> Result<Vec<Job>>;

    async fn list_in_states(&self, states: &[JobState]) -> Result<Vec<Job>>;

    /// Compare-and-swap a job from `change.from` to `change.to`.
    ///
    /// Fails with [`StoreError::Conflict`] when the job is no longer in
    /// `change.from`; the stored job is then left untouched.
    async fn transition(&self, id: Uuid, change: &Transition) -> Result<(Job, JobEvent)>;

    /// Event history of a job, oldest first
    async fn events(&self, id: Uuid) -> Result<Vec<JobEvent>>;
}

/// A requested state change together with the fields it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    /// Node receiving the job, required when entering STARTING
    pub node_id: Option<String>,
    /// Required when entering SUCCEEDED or FAILED, forbidden otherwise
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    /// Count this re-queue against the retry limit
    pub count_retry: bool,
}

impl Transition {
    pub fn new(from: JobState, to: JobState) -> Self {
        Self {
            from,
            to,
            node_id: None,
            exit_code: None,
            reason: None,
            count_retry: false,
        }
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn as_retry(mut self) -> Self {
        self.count_retry = true;
        self
    }

    /// Computes the job that results from applying this transition to `job`.
    ///
    /// Pure; stores call it while holding whatever serializes writes to the job.
    pub fn apply(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        retry_limit: u32,
    ) -> Result<(Job, JobEvent)> {
        if job.state != self.from {
            return Err(StoreError::Conflict {
                id: job.id,
                expected: self.from,
                actual: job.state,
            });
        }
        if !self.from.can_transition_to(self.to) {
            return Err(StoreError::IllegalTransition {
                id: job.id,
                from: self.from,
                to: self.to,
            });
        }

        let wants_exit_code = matches!(self.to, JobState::Succeeded | JobState::Failed);
        if wants_exit_code != self.exit_code.is_some() {
            return Err(StoreError::Invariant(format!(
                "transition {} -> {} of job {} with exit_code {:?}",
                self.from, self.to, job.id, self.exit_code
            )));
        }

        // never stamp a time earlier than what the job already carries
        let now = [job.queued_at, job.started_at, job.finished_at]
            .into_iter()
            .flatten()
            .fold(now.max(job.created_at), |acc, ts| acc.max(ts));

        let mut next = job.clone();
        next.state = self.to;
        next.exit_code = self.exit_code;

        match self.to {
            JobState::Starting => {
                let node_id = self.node_id.clone().ok_or_else(|| {
                    StoreError::Invariant(format!("job {} started without a node", job.id))
                })?;
                next.node_id = Some(node_id);
                next.assigned_at = Some(now);
                next.queued_at.get_or_insert(now);
            }
            JobState::Running => {
                next.started_at = Some(now);
            }
            JobState::Queued => {
                next.node_id = None;
                next.assigned_at = None;
                next.started_at = None;
                next.queued_at = Some(now);
                if self.count_retry {
                    next.retry_count += 1;
                }
            }
            JobState::Succeeded | JobState::Failed | JobState::Canceled | JobState::Lost => {
                next.node_id = None;
                next.finished_at = Some(now);
            }
        }

        next.check_invariants(retry_limit)
            .map_err(StoreError::Invariant)?;

        let event = JobEvent {
            job_id: job.id,
            at: now,
            from: Some(self.from),
            to: self.to,
            node_id: next.node_id.clone().or_else(|| job.node_id.clone()),
            reason: self.reason.clone(),
            retry_count: next.retry_count,
        };

        Ok((next, event))
    }
}

/// Event recorded when a job is first stored
pub fn submission_event(job: &Job) -> JobEvent {
    JobEvent {
        job_id: job.id,
        at: job.created_at,
        from: None,
        to: job.state,
        node_id: None,
        reason: Some("submitted".to_string()),
        retry_count: job.retry_count,
    }
}
