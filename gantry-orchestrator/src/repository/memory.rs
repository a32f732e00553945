//! In-memory Job Store
//!
//! Jobs live in a map of individually locked entries: the map lock is only
//! held long enough to find or insert an entry, and every mutation of a job
//! happens under that job's own mutex.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::domain::job::{Job, JobEvent, JobState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use uuid::Uuid;

use super::{JobStore, Result, StoreError, Transition, submission_event};

struct Entry {
    job: Job,
    events: Vec<JobEvent>,
}

/// Job store backed by process memory
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<Entry>>>>,
    retry_limit: u32,
}

impl MemoryJobStore {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retry_limit,
        }
    }

    fn entry(&self, id: Uuid) -> Result<Arc<Mutex<Entry>>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<Entry>>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.values().cloned().collect()
    }
}

fn lock(entry: &Mutex<Entry>) -> MutexGuard<'_, Entry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobEvent> {
        job.check_invariants(self.retry_limit)
            .map_err(StoreError::Invariant)?;

        let event = submission_event(&job);
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        jobs.insert(
            job.id,
            Arc::new(Mutex::new(Entry {
                job,
                events: vec![event.clone()],
            })),
        );

        Ok(event)
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        let entry = self.entry(id)?;
        let job = lock(&entry).job.clone();
        Ok(job)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self
            .snapshot()
            .iter()
            .map(|entry| lock(entry).job.clone())
            .collect())
    }

    async fn list_in_states(&self, states: &[JobState]) -> Result<Vec<Job>> {
        Ok(self
            .snapshot()
            .iter()
            .filter_map(|entry| {
                let entry = lock(entry);
                states.contains(&entry.job.state).then(|| entry.job.clone())
            })
            .collect())
    }

    async fn transition(&self, id: Uuid, change: &Transition) -> Result<(Job, JobEvent)> {
        let entry = self.entry(id)?;
        let mut entry = lock(&entry);

        let (next, event) = change.apply(&entry.job, Utc::now(), self.retry_limit)?;
        entry.job = next.clone();
        entry.events.push(event.clone());

        Ok((next, event))
    }

    async fn events(&self, id: Uuid) -> Result<Vec<JobEvent>> {
        let entry = self.entry(id)?;
        let events = lock(&entry).events.clone();
        Ok(events)
    }
}
