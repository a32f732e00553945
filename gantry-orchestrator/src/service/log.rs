//! Log Service
//!
//! Captured job output, kept in memory per job.
//!
//! Node agents push chunks with [`LogService::append`]; readers either fetch
//! the whole text or follow it. Followers wait on a watch channel carrying the
//! chunk count, so a follower that is dropped simply stops polling and holds
//! nothing but its receiver.

use futures::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Service error type
#[derive(Debug, Error)]
pub enum LogError {
    #[error("no logs for job {0}")]
    NotFound(Uuid),

    #[error("log chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },

    /// The job ended without its node confirming the end of output
    #[error("log stream of job {0} was interrupted")]
    StreamInterrupted(Uuid),
}

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Default)]
struct LogState {
    chunks: Vec<String>,
    closed: bool,
    interrupted: bool,
}

struct JobLog {
    state: Mutex<LogState>,
    /// Number of chunks written so far, bumped on close as well
    notify: watch::Sender<usize>,
}

impl JobLog {
    fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            notify,
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct LogService {
    logs: RwLock<HashMap<Uuid, Arc<JobLog>>>,
    max_chunk_bytes: usize,
}

impl LogService {
    pub fn new(max_chunk_bytes: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            max_chunk_bytes,
        }
    }

    fn find(&self, job_id: Uuid) -> Option<Arc<JobLog>> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        logs.get(&job_id).cloned()
    }

    fn find_or_create(&self, job_id: Uuid) -> Arc<JobLog> {
        if let Some(log) = self.find(job_id) {
            return log;
        }
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(logs.entry(job_id).or_insert_with(|| Arc::new(JobLog::new())))
    }

    /// Appends a chunk of captured output
    pub fn append(&self, job_id: Uuid, chunk: String) -> Result<()> {
        if chunk.len() > self.max_chunk_bytes {
            return Err(LogError::ChunkTooLarge {
                size: chunk.len(),
                max: self.max_chunk_bytes,
            });
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let log = self.find_or_create(job_id);
        let mut state = log.state();
        if state.closed {
            tracing::debug!("Late log chunk for job {} after close", job_id);
        }
        state.chunks.push(chunk);
        // publish under the lock so counts are never observed out of order
        log.notify.send_replace(state.chunks.len());

        Ok(())
    }

    /// Everything captured so far
    pub fn fetch(&self, job_id: Uuid) -> Result<String> {
        let log = self.find(job_id).ok_or(LogError::NotFound(job_id))?;
        let state = log.state();
        if state.chunks.is_empty() {
            return Err(LogError::NotFound(job_id));
        }
        Ok(state.chunks.concat())
    }

    /// Marks a job's output as complete.
    ///
    /// Followers drain what is buffered and then end; when `interrupted` they
    /// receive [`LogError::StreamInterrupted`] instead of a clean end.
    /// Closing twice keeps the first outcome.
    pub fn close(&self, job_id: Uuid, interrupted: bool) {
        let log = self.find_or_create(job_id);
        let mut state = log.state();
        if state.closed {
            return;
        }
        state.closed = true;
        state.interrupted = interrupted;
        log.notify.send_modify(|_| {});
        tracing::debug!("Closed log of job {} (interrupted: {})", job_id, interrupted);
    }

    /// Follows a job's output from the first chunk on.
    ///
    /// The stream yields every chunk once, in write order, and ends after the
    /// log is closed and drained. Dropping it detaches the follower.
    pub fn follow(&self, job_id: Uuid) -> impl Stream<Item = Result<String>> + Send + 'static {
        let log = self.find_or_create(job_id);
        let rx = log.notify.subscribe();
        let follower = Follower {
            job_id,
            log,
            rx,
            cursor: 0,
            done: false,
        };

        futures::stream::unfold(follower, |mut follower| async move {
            let item = follower.next().await?;
            Some((item, follower))
        })
    }

    /// Number of live followers of a job's log
    pub fn follower_count(&self, job_id: Uuid) -> usize {
        self.find(job_id)
            .map(|log| log.notify.receiver_count())
            .unwrap_or(0)
    }
}

struct Follower {
    job_id: Uuid,
    log: Arc<JobLog>,
    rx: watch::Receiver<usize>,
    cursor: usize,
    done: bool,
}

impl Follower {
    async fn next(&mut self) -> Option<Result<String>> {
        loop {
            if self.done {
                return None;
            }

            // mark the current version seen before looking, so a write landing
            // after the look wakes `changed` below
            self.rx.borrow_and_update();
            {
                let state = self.log.state();
                if let Some(chunk) = state.chunks.get(self.cursor) {
                    self.cursor += 1;
                    return Some(Ok(chunk.clone()));
                }
                if state.closed {
                    self.done = true;
                    return state
                        .interrupted
                        .then(|| Err(LogError::StreamInterrupted(self.job_id)));
                }
            }

            // the sender lives in `self.log`, so this only fails if it is gone
            if self.rx.changed().await.is_err() {
                self.done = true;
                return Some(Err(LogError::StreamInterrupted(self.job_id)));
            }
        }
    }
}
