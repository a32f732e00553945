//! Job Service
//!
//! Business logic for job submission, queries and state changes.

use chrono::Utc;
use gantry_core::domain::identity::Identity;
use gantry_core::domain::job::{
    Job, JobEvent, JobState, MAX_PRIORITY, MAX_RUNTIME_MINUTES, MIN_PRIORITY,
};
use gantry_core::dto::job::{JobPage, JobQuery, SubmitJob};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::repository::{JobStore, StoreError, Transition};

/// Capacity of the live job-event feed per subscriber
const EVENT_FEED_CAPACITY: usize = 256;

/// Service error type
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    ValidationError(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(StoreError),
}

impl JobError {
    /// The job moved on before the requested change could be applied
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_conflict())
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id),
            other => JobError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

pub struct JobService {
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<JobEvent>,
    max_gpus_per_job: u32,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, max_gpus_per_job: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        Self {
            store,
            events,
            max_gpus_per_job,
        }
    }

    /// Admit a new job into the queue
    pub async fn submit(&self, req: SubmitJob, owner: Option<&Identity>) -> Result<Job> {
        validate_submission(&req, self.max_gpus_per_job)?;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            command: req.command,
            owner_id: owner.map(|o| o.id.clone()),
            gpu_count: req.gpu_count,
            priority: req.priority,
            cwd: req.cwd,
            max_runtime_minutes: req.max_runtime_minutes,
            retry_count: 0,
            exit_code: None,
            state: JobState::Queued,
            node_id: None,
            created_at: now,
            queued_at: Some(now),
            assigned_at: None,
            started_at: None,
            finished_at: None,
        };

        let event = self.store.insert(job.clone()).await?;
        self.publish(event);

        tracing::info!(
            "Job submitted: {} ({} GPUs, priority {})",
            job.id,
            job.gpu_count,
            job.priority
        );

        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        Ok(self.store.get(id).await?)
    }

    /// Filtered, sorted and paged listing
    pub async fn list(&self, query: &JobQuery) -> Result<JobPage> {
        let jobs = self.store.list().await?;
        Ok(query.apply(jobs))
    }

    pub async fn list_all(&self) -> Result<Vec<Job>> {
        Ok(self.store.list().await?)
    }

    pub async fn list_in_states(&self, states: &[JobState]) -> Result<Vec<Job>> {
        Ok(self.store.list_in_states(states).await?)
    }

    /// Compare-and-swap a job's state and publish the resulting event
    pub async fn transition(&self, id: Uuid, change: Transition) -> Result<Job> {
        let (job, event) = self.store.transition(id, &change).await?;
        tracing::debug!(
            "Job {} {} -> {}{}",
            id,
            change.from,
            change.to,
            change
                .reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        self.publish(event);
        Ok(job)
    }

    pub async fn events(&self, id: Uuid) -> Result<Vec<JobEvent>> {
        Ok(self.store.events(id).await?)
    }

    /// Live feed of job events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_submission(req: &SubmitJob, max_gpus_per_job: u32) -> Result<()> {
    const MAX_COMMAND_LENGTH: usize = 8192;
    const MAX_CWD_LENGTH: usize = 4096;

    if req.command.trim().is_empty() {
        return Err(JobError::ValidationError(
            "command cannot be empty".to_string(),
        ));
    }
    if req.command.len() > MAX_COMMAND_LENGTH {
        return Err(JobError::ValidationError(format!(
            "command too long (max: {} bytes)",
            MAX_COMMAND_LENGTH
        )));
    }
    if req.gpu_count < 1 {
        return Err(JobError::ValidationError(
            "gpu_count must be at least 1".to_string(),
        ));
    }
    if req.gpu_count > max_gpus_per_job {
        return Err(JobError::ValidationError(format!(
            "gpu_count {} exceeds the per-job maximum of {}",
            req.gpu_count, max_gpus_per_job
        )));
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&req.priority) {
        return Err(JobError::ValidationError(format!(
            "priority must be within {}..={}, got {}",
            MIN_PRIORITY, MAX_PRIORITY, req.priority
        )));
    }
    if req.max_runtime_minutes > MAX_RUNTIME_MINUTES {
        return Err(JobError::ValidationError(format!(
            "max_runtime_minutes must be at most {}, got {}",
            MAX_RUNTIME_MINUTES, req.max_runtime_minutes
        )));
    }
    if req.cwd.trim().is_empty() {
        return Err(JobError::ValidationError("cwd cannot be empty".to_string()));
    }
    if req.cwd.len() > MAX_CWD_LENGTH {
        return Err(JobError::ValidationError(format!(
            "cwd too long (max: {} bytes)",
            MAX_CWD_LENGTH
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryJobStore;
    use gantry_core::domain::job::DEFAULT_RETRY_LIMIT;

    fn submit_req() -> SubmitJob {
        SubmitJob {
            command: "python train.py".to_string(),
            gpu_count: 2,
            cwd: "/work".to_string(),
            priority: 5,
            max_runtime_minutes: 0,
        }
    }

    fn service() -> JobService {
        JobService::new(Arc::new(MemoryJobStore::new(DEFAULT_RETRY_LIMIT)), 8)
    }

    #[test]
    fn test_validate_submission_valid() {
        assert!(validate_submission(&submit_req(), 8).is_ok());

        let mut longest = submit_req();
        longest.max_runtime_minutes = MAX_RUNTIME_MINUTES;
        assert!(validate_submission(&longest, 8).is_ok());
    }

    #[test]
    fn test_validate_submission_invalid() {
        let cases: [fn(&mut SubmitJob); 8] = [
            |r: &mut SubmitJob| r.command = "   ".to_string(),
            |r: &mut SubmitJob| r.gpu_count = 0,
            |r: &mut SubmitJob| r.gpu_count = 9,
            |r: &mut SubmitJob| r.priority = 0,
            |r: &mut SubmitJob| r.priority = 11,
            |r: &mut SubmitJob| r.cwd = String::new(),
            |r: &mut SubmitJob| r.max_runtime_minutes = MAX_RUNTIME_MINUTES + 1,
            |r: &mut SubmitJob| r.max_runtime_minutes = 3_000_000_000,
        ];
        for mutate in cases {
            let mut req = submit_req();
            mutate(&mut req);
            assert!(matches!(
                validate_submission(&req, 8),
                Err(JobError::ValidationError(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_submit_creates_queued_job_and_publishes() {
        let service = service();
        let mut feed = service.subscribe();
        let owner = Identity {
            id: "u1".to_string(),
            name: "Ada".to_string(),
        };

        let job = service.submit(submit_req(), Some(&owner)).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.owner_id.as_deref(), Some("u1"));
        assert_eq!(job.queued_at, Some(job.created_at));

        let event = feed.recv().await.unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.to, JobState::Queued);
    }

    #[tokio::test]
    async fn test_missing_job_maps_to_not_found() {
        let service = service();
        let id = Uuid::new_v4();
        assert!(matches!(service.get(id).await, Err(JobError::NotFound(_))));
        assert!(matches!(service.events(id).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transition_conflict_is_reported() {
        let service = service();
        let job = service.submit(submit_req(), None).await.unwrap();
        service
            .transition(job.id, Transition::new(JobState::Queued, JobState::Canceled))
            .await
            .unwrap();

        let err = service
            .transition(job.id, Transition::new(JobState::Queued, JobState::Canceled))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
