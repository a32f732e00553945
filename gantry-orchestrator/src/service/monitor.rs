//! Lifecycle Monitor
//!
//! Advances jobs after they have been placed: consumes node agent reports,
//! carries out cancellations, applies the retry policy, and periodically
//! sweeps for dead nodes, runtime overruns and stuck launches.
//!
//! Every change goes through the job store's compare-and-swap. When two
//! changes race (a cancel and an exit report, say) one of them loses with a
//! conflict, which is logged and dropped. A job leaving STARTING/RUNNING gives
//! its reservation back through [`LifecycleMonitor::finish`], the single place
//! that releases GPUs.

use chrono::{DateTime, TimeDelta, Utc};
use gantry_core::domain::job::{
    Job, JobState, LAUNCH_FAILED_EXIT_CODE, TIMEOUT_EXIT_CODE, UNSCHEDULABLE_EXIT_CODE,
};
use gantry_core::dto::job::JobReport;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::to_delta;
use crate::registry::NodeRegistry;
use crate::repository::Transition;
use crate::service::dispatch::Dispatcher;
use crate::service::job::{JobError, JobService, Result};
use crate::service::log::LogService;

/// How often a cancel is re-attempted when the job changes state underneath it
const CANCEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sweep_interval: Duration,
    /// Longest a job may stay STARTING before it counts as a failed launch
    pub launch_timeout: Duration,
    /// Longest a cancel waits for the node to acknowledge termination
    pub cancel_grace: Duration,
    pub retry_limit: u32,
}

/// What one sweep changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub lost: usize,
    pub timed_out: usize,
    pub launch_timeouts: usize,
    pub forced_cancels: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct LifecycleMonitor {
    jobs: Arc<JobService>,
    registry: Arc<NodeRegistry>,
    logs: Arc<LogService>,
    dispatcher: Arc<dyn Dispatcher>,
    /// Wakes the scheduler when GPUs are released
    trigger: Arc<Notify>,
    config: MonitorConfig,
    /// Jobs whose termination was requested, with the request time
    pending_cancels: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl LifecycleMonitor {
    pub fn new(
        jobs: Arc<JobService>,
        registry: Arc<NodeRegistry>,
        logs: Arc<LogService>,
        dispatcher: Arc<dyn Dispatcher>,
        trigger: Arc<Notify>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            jobs,
            registry,
            logs,
            dispatcher,
            trigger,
            config,
            pending_cancels: Mutex::new(HashMap::new()),
        }
    }

    fn pending_cancels(&self) -> MutexGuard<'_, HashMap<Uuid, DateTime<Utc>>> {
        self.pending_cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_requested_at(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        self.pending_cancels().get(&job_id).copied()
    }

    // =============================================================================
    // Transitions
    // =============================================================================

    /// Applies a transition and settles what depends on it: the reservation
    /// of a job leaving STARTING/RUNNING is released, the log of a finished
    /// job is closed.
    pub async fn finish(&self, job_id: Uuid, change: Transition) -> Result<Job> {
        let job = self.jobs.transition(job_id, change).await?;

        if !job.state.holds_assignment() {
            self.pending_cancels().remove(&job_id);
            match self.registry.release_job(job_id) {
                Ok(true) => self.trigger.notify_one(),
                Ok(false) => {}
                Err(e) => error!("Failed to release reservation of job {}: {}", job_id, e),
            }
        }
        if job.state.is_terminal() {
            self.logs.close(job_id, job.state == JobState::Lost);
            info!("Job {} finished as {}", job_id, job.state);
        }

        Ok(job)
    }

    /// Handles a failed attempt: re-queue while retries remain, otherwise
    /// fail for good.
    async fn fail(&self, job: &Job, exit_code: i32, reason: &str) -> Result<Job> {
        let limit = self.config.retry_limit;

        if job.retry_count < limit {
            let attempt = job.retry_count + 1;
            let requeued = self
                .finish(
                    job.id,
                    Transition::new(job.state, JobState::Queued)
                        .as_retry()
                        .with_reason(format!("retry {}/{}: {}", attempt, limit, reason)),
                )
                .await?;

            let marker = format!(
                "\n[gantry] attempt {} failed ({}), retrying\n",
                attempt, reason
            );
            if let Err(e) = self.logs.append(job.id, marker) {
                debug!("Could not mark retry in log of job {}: {}", job.id, e);
            }
            info!("Job {} re-queued for retry {}/{}", job.id, attempt, limit);

            return Ok(requeued);
        }

        warn!("Job {} failed after {} retries: {}", job.id, limit, reason);
        self.finish(
            job.id,
            Transition::new(job.state, JobState::Failed)
                .with_exit_code(exit_code)
                .with_reason(reason),
        )
        .await
    }

    // =============================================================================
    // Node Reports
    // =============================================================================

    /// Applies a report from a node agent.
    ///
    /// Returns `None` when the report was ignored, either because it came from
    /// a node the job is no longer assigned to or because it lost a race.
    pub async fn report(&self, job_id: Uuid, report: JobReport) -> Result<Option<Job>> {
        let job = self.jobs.get(job_id).await?;

        if job.node_id.as_deref() != Some(report.node_id()) {
            warn!(
                "Ignoring stale report from {} for job {} (assigned: {:?}, state: {})",
                report.node_id(),
                job_id,
                job.node_id,
                job.state
            );
            return Ok(None);
        }
        if let Some(attempt) = report.attempt().filter(|a| *a != job.retry_count) {
            warn!(
                "Ignoring stale report for attempt {} of job {} (current: {})",
                attempt, job_id, job.retry_count
            );
            return Ok(None);
        }

        let outcome = match report {
            JobReport::Started { .. } => {
                self.finish(
                    job_id,
                    Transition::new(JobState::Starting, JobState::Running).with_reason("started"),
                )
                .await
            }
            JobReport::LaunchFailed {
                reason, exit_code, ..
            } => {
                let reason = reason.unwrap_or_else(|| "launch failed".to_string());
                self.fail(&job, exit_code.unwrap_or(LAUNCH_FAILED_EXIT_CODE), &reason)
                    .await
            }
            JobReport::Exited { exit_code, .. } => self.exited(job, exit_code).await,
        };

        match outcome {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_conflict() => {
                warn!("Ignoring report for job {}: {}", job_id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn exited(&self, job: Job, exit_code: i32) -> Result<Job> {
        let job = if job.state == JobState::Starting {
            // the start report may have been lost or overtaken
            self.finish(
                job.id,
                Transition::new(JobState::Starting, JobState::Running)
                    .with_reason("exited before start was reported"),
            )
            .await?
        } else {
            job
        };

        if self.cancel_requested_at(job.id).is_some() {
            return self
                .finish(
                    job.id,
                    Transition::new(JobState::Running, JobState::Canceled)
                        .with_reason("terminated on request"),
                )
                .await;
        }

        if exit_code == 0 {
            self.finish(
                job.id,
                Transition::new(JobState::Running, JobState::Succeeded).with_exit_code(0),
            )
            .await
        } else {
            self.fail(&job, exit_code, &format!("exited with code {}", exit_code))
                .await
        }
    }

    // =============================================================================
    // Cancellation
    // =============================================================================

    /// Cancels a job.
    ///
    /// A queued job is canceled on the spot. A placed job is canceled once
    /// its node acknowledges termination; without an acknowledgement the job
    /// is returned unchanged and the sweep forces the cancel after the grace
    /// period.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        for attempt in 0..CANCEL_ATTEMPTS {
            let job = self.jobs.get(job_id).await?;

            let outcome = match job.state {
                JobState::Queued => {
                    self.finish(
                        job_id,
                        Transition::new(JobState::Queued, JobState::Canceled)
                            .with_reason("canceled by user"),
                    )
                    .await
                }
                JobState::Starting | JobState::Running => self.request_termination(job).await,
                // a previous attempt lost to a racing exit report that honored the cancel
                JobState::Canceled if attempt > 0 => return Ok(job),
                state => {
                    return Err(JobError::InvalidState(format!(
                        "job {} is already {}",
                        job_id, state
                    )));
                }
            };

            match outcome {
                Err(e) if e.is_conflict() => {
                    debug!("Cancel of job {} raced a state change, retrying", job_id);
                }
                other => return other,
            }
        }

        Err(JobError::InvalidState(format!(
            "job {} kept changing state, cancel not applied",
            job_id
        )))
    }

    async fn request_termination(&self, job: Job) -> Result<Job> {
        self.pending_cancels().entry(job.id).or_insert_with(Utc::now);

        let Some(node_id) = job.node_id.as_deref() else {
            return Ok(job);
        };
        let node = match self.registry.get(node_id) {
            Ok(node) => node,
            Err(e) => {
                warn!("Cannot reach node of job {}: {}", job.id, e);
                return Ok(job);
            }
        };

        match self.dispatcher.terminate(&node, job.id).await {
            // an agent that no longer knows the job has nothing left to stop
            Err(e) if e.is_not_found() => {
                debug!("Agent on {} does not know job {}", node.id, job.id);
                self.finish(
                    job.id,
                    Transition::new(job.state, JobState::Canceled).with_reason("canceled by user"),
                )
                .await
            }
            Ok(()) => {
                self.finish(
                    job.id,
                    Transition::new(job.state, JobState::Canceled).with_reason("canceled by user"),
                )
                .await
            }
            Err(e) => {
                warn!(
                    "Termination of job {} not acknowledged, forcing after grace period: {}",
                    job.id, e
                );
                Ok(job)
            }
        }
    }

    // =============================================================================
    // Scheduler Hand-backs
    // =============================================================================

    /// Returns a job whose dispatch failed to the queue; not a retry
    pub async fn requeue_undispatched(&self, job_id: Uuid, reason: &str) -> Result<Job> {
        self.finish(
            job_id,
            Transition::new(JobState::Starting, JobState::Queued).with_reason(reason),
        )
        .await
    }

    /// Fails a queued job no node can ever fit
    pub async fn fail_unschedulable(&self, job_id: Uuid, reason: &str) -> Result<Job> {
        self.finish(
            job_id,
            Transition::new(JobState::Queued, JobState::Failed)
                .with_exit_code(UNSCHEDULABLE_EXIT_CODE)
                .with_reason(reason),
        )
        .await
    }

    // =============================================================================
    // Sweep
    // =============================================================================

    /// Marks placed jobs LOST when the registry has no reservation for them.
    ///
    /// Reservations live only in memory, so after a restart over a durable
    /// store nothing vouches for jobs that were in flight.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let placed = self
            .jobs
            .list_in_states(&[JobState::Starting, JobState::Running])
            .await?;

        let mut recovered = 0;
        for job in placed {
            if self.registry.reservation_node(job.id).is_some() {
                continue;
            }
            match self
                .finish(
                    job.id,
                    Transition::new(job.state, JobState::Lost)
                        .with_reason("orchestrator restarted while job was placed"),
                )
                .await
            {
                Ok(_) => recovered += 1,
                Err(e) => warn!("Could not recover job {}: {}", job.id, e),
            }
        }

        if recovered > 0 {
            warn!("Marked {} orphaned job(s) LOST", recovered);
        }
        Ok(recovered)
    }

    /// Runs one sweep as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let dead: HashSet<String> = self.registry.sweep_at(now).into_iter().collect();
        let placed = self
            .jobs
            .list_in_states(&[JobState::Starting, JobState::Running])
            .await?;

        let mut report = SweepReport::default();
        for job in placed {
            let job_id = job.id;
            // one bad job must not stop the sweep
            match self.sweep_job(job, &dead, now, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    debug!("Job {} changed during sweep: {}", job_id, e);
                }
                Err(e) => error!("Sweep of job {} failed: {}", job_id, e),
            }
        }

        Ok(report)
    }

    async fn sweep_job(
        &self,
        job: Job,
        dead: &HashSet<String>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let Some(node_id) = job.node_id.clone() else {
            return Ok(());
        };

        if dead.contains(&node_id) {
            self.finish(
                job.id,
                Transition::new(job.state, JobState::Lost)
                    .with_reason(format!("node {} stopped heartbeating", node_id)),
            )
            .await?;
            report.lost += 1;
            return Ok(());
        }

        let cancel_overdue = self
            .cancel_requested_at(job.id)
            .is_some_and(|requested| now - requested > to_delta(self.config.cancel_grace));
        if cancel_overdue {
            self.finish(
                job.id,
                Transition::new(job.state, JobState::Canceled)
                    .with_reason("cancel forced after grace period"),
            )
            .await?;
            report.forced_cancels += 1;
            return Ok(());
        }

        let overran = job.max_runtime_minutes > 0
            && job.started_at.is_some_and(|started| {
                now - started > TimeDelta::minutes(i64::from(job.max_runtime_minutes))
            });
        if overran {
            self.terminate_best_effort(&node_id, job.id).await;
            self.finish(
                job.id,
                Transition::new(job.state, JobState::Failed)
                    .with_exit_code(TIMEOUT_EXIT_CODE)
                    .with_reason(format!(
                        "exceeded max runtime of {} minutes",
                        job.max_runtime_minutes
                    )),
            )
            .await?;
            report.timed_out += 1;
            return Ok(());
        }

        let launch_stuck = job.state == JobState::Starting
            && job
                .assigned_at
                .is_some_and(|assigned| now - assigned > to_delta(self.config.launch_timeout));
        if launch_stuck {
            self.terminate_best_effort(&node_id, job.id).await;
            self.fail(&job, LAUNCH_FAILED_EXIT_CODE, "no start report within launch timeout")
                .await?;
            report.launch_timeouts += 1;
        }

        Ok(())
    }

    async fn terminate_best_effort(&self, node_id: &str, job_id: Uuid) {
        let node = match self.registry.get(node_id) {
            Ok(node) => node,
            Err(_) => return,
        };
        if let Err(e) = self.dispatcher.terminate(&node, job_id).await {
            warn!("Could not terminate job {} on {}: {}", job_id, node_id, e);
        }
    }

    // =============================================================================
    // Background Loop
    // =============================================================================

    /// Sweeps on a fixed interval until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting lifecycle monitor (interval: {:?})",
            self.config.sweep_interval
        );

        let mut interval = time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(report) if !report.is_empty() => info!("Sweep: {:?}", report),
                        Ok(_) => debug!("Sweep found nothing to do"),
                        Err(e) => error!("Error during sweep: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Lifecycle monitor stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::tests::heartbeat;
    use crate::repository::MemoryJobStore;
    use crate::service::dispatch::testing::{Call, RecordingDispatcher};
    use gantry_core::domain::job::DEFAULT_RETRY_LIMIT;
    use gantry_core::dto::job::SubmitJob;

    pub(crate) struct Fixture {
        pub jobs: Arc<JobService>,
        pub registry: Arc<NodeRegistry>,
        pub logs: Arc<LogService>,
        pub dispatcher: Arc<RecordingDispatcher>,
        pub trigger: Arc<Notify>,
        pub monitor: Arc<LifecycleMonitor>,
    }

    pub(crate) fn fixture() -> Fixture {
        let jobs = Arc::new(JobService::new(
            Arc::new(MemoryJobStore::new(DEFAULT_RETRY_LIMIT)),
            8,
        ));
        let registry = Arc::new(NodeRegistry::new(
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let logs = Arc::new(LogService::new(1024));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let trigger = Arc::new(Notify::new());
        let monitor = Arc::new(LifecycleMonitor::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            Arc::clone(&logs),
            dispatcher.clone(),
            Arc::clone(&trigger),
            MonitorConfig {
                sweep_interval: Duration::from_secs(5),
                launch_timeout: Duration::from_secs(120),
                cancel_grace: Duration::from_secs(30),
                retry_limit: DEFAULT_RETRY_LIMIT,
            },
        ));
        Fixture {
            jobs,
            registry,
            logs,
            dispatcher,
            trigger,
            monitor,
        }
    }

    pub(crate) fn submit_req(gpus: u32, priority: i32) -> SubmitJob {
        SubmitJob {
            command: "python train.py".to_string(),
            gpu_count: gpus,
            cwd: "/work".to_string(),
            priority,
            max_runtime_minutes: 0,
        }
    }

    impl Fixture {
        /// Places a queued job on `node` the way the scheduler does
        async fn place(&self, job: &Job, node: &str) -> Job {
            let res = self.registry.reserve(node, job.id, job.gpu_count).unwrap();
            let placed = self
                .jobs
                .transition(
                    job.id,
                    Transition::new(JobState::Queued, JobState::Starting).on_node(node),
                )
                .await
                .unwrap();
            self.registry.commit(res).unwrap();
            placed
        }

        async fn running(&self, gpus: u32, node: &str) -> Job {
            let job = self.jobs.submit(submit_req(gpus, 1), None).await.unwrap();
            self.place(&job, node).await;
            self.monitor
                .report(
                    job.id,
                    JobReport::Started {
                        node_id: node.to_string(),
                        attempt: None,
                    },
                )
                .await
                .unwrap()
                .unwrap()
        }

        fn gpu_free(&self, node: &str) -> u32 {
            self.registry.get(node).unwrap().gpu_free
        }
    }

    fn exited(node: &str, exit_code: i32) -> JobReport {
        JobReport::Exited {
            node_id: node.to_string(),
            attempt: None,
            exit_code,
        }
    }

    #[tokio::test]
    async fn test_success_releases_reservation() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();

        let job = f.running(2, "n1").await;
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
        assert_eq!(f.gpu_free("n1"), 2);

        let done = f.monitor.report(job.id, exited("n1", 0)).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(f.gpu_free("n1"), 4);
    }

    #[tokio::test]
    async fn test_stale_report_ignored() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.running(1, "n1").await;

        let ignored = f.monitor.report(job.id, exited("n2", 0)).await.unwrap();
        assert!(ignored.is_none());
        assert_eq!(f.jobs.get(job.id).await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn test_report_from_earlier_attempt_ignored() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.jobs.submit(submit_req(1, 1), None).await.unwrap();

        f.place(&job, "n1").await;
        let failed_launch = JobReport::LaunchFailed {
            node_id: "n1".to_string(),
            attempt: Some(0),
            reason: None,
            exit_code: None,
        };
        let requeued = f.monitor.report(job.id, failed_launch).await.unwrap().unwrap();
        assert_eq!(requeued.retry_count, 1);

        // retried on the same node, then attempt 0 reports late
        f.place(&job, "n1").await;
        let late = JobReport::Exited {
            node_id: "n1".to_string(),
            attempt: Some(0),
            exit_code: 0,
        };
        assert!(f.monitor.report(job.id, late).await.unwrap().is_none());
        assert_eq!(f.jobs.get(job.id).await.unwrap().state, JobState::Starting);
        assert_eq!(f.gpu_free("n1"), 3);

        let started = JobReport::Started {
            node_id: "n1".to_string(),
            attempt: Some(1),
        };
        let running = f.monitor.report(job.id, started).await.unwrap().unwrap();
        assert_eq!(running.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_failures_retry_then_fail_for_good() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.jobs.submit(submit_req(1, 1), None).await.unwrap();

        for attempt in 1..=DEFAULT_RETRY_LIMIT {
            f.place(&job, "n1").await;
            let requeued = f
                .monitor
                .report(
                    job.id,
                    JobReport::LaunchFailed {
                        node_id: "n1".to_string(),
                        attempt: None,
                        reason: Some("no such file".to_string()),
                        exit_code: None,
                    },
                )
                .await
                .unwrap()
                .unwrap();
            assert_eq!(requeued.state, JobState::Queued);
            assert_eq!(requeued.retry_count, attempt);
            assert_eq!(f.gpu_free("n1"), 4);
        }

        // the fourth failure is final
        f.place(&job, "n1").await;
        f.monitor
            .report(
                job.id,
                JobReport::Started {
                    node_id: "n1".to_string(),
                    attempt: None,
                },
            )
            .await
            .unwrap();
        let failed = f.monitor.report(job.id, exited("n1", 2)).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.exit_code, Some(2));
        assert_eq!(failed.retry_count, DEFAULT_RETRY_LIMIT);
        assert_eq!(f.gpu_free("n1"), 4);
        assert!(f.logs.fetch(job.id).unwrap().contains("attempt 3 failed"));
    }

    #[tokio::test]
    async fn test_cancel_queued_job_is_synchronous() {
        let f = fixture();
        let job = f.jobs.submit(submit_req(1, 1), None).await.unwrap();

        let canceled = f.monitor.cancel(job.id).await.unwrap();
        assert_eq!(canceled.state, JobState::Canceled);
        assert!(f.dispatcher.calls().is_empty());

        let err = f.monitor.cancel(job.id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_running_job_with_acknowledgement() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.running(3, "n1").await;

        let canceled = f.monitor.cancel(job.id).await.unwrap();
        assert_eq!(canceled.state, JobState::Canceled);
        assert_eq!(f.dispatcher.calls(), vec![Call::Terminate("n1".to_string(), job.id)]);
        assert_eq!(f.gpu_free("n1"), 4);
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_forced_after_grace() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.running(1, "n1").await;
        f.dispatcher.fail_terminate(true);

        let pending = f.monitor.cancel(job.id).await.unwrap();
        assert_eq!(pending.state, JobState::Running);

        let now = Utc::now();
        let report = f.monitor.sweep_at(now).await.unwrap();
        assert!(report.is_empty());

        let later = now + TimeDelta::seconds(31);
        f.registry.heartbeat_at("n1", heartbeat(4), later).unwrap();
        let report = f.monitor.sweep_at(later).await.unwrap();
        assert_eq!(report.forced_cancels, 1);
        assert_eq!(f.jobs.get(job.id).await.unwrap().state, JobState::Canceled);
        assert_eq!(f.gpu_free("n1"), 4);
    }

    #[tokio::test]
    async fn test_exit_after_cancel_request_counts_as_acknowledgement() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.running(1, "n1").await;
        f.dispatcher.fail_terminate(true);
        f.monitor.cancel(job.id).await.unwrap();

        let done = f.monitor.report(job.id, exited("n1", 143)).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Canceled);
        assert_eq!(done.exit_code, None);
    }

    #[tokio::test]
    async fn test_dead_node_loses_its_jobs() {
        let f = fixture();
        let t0 = Utc::now();
        f.registry.heartbeat_at("n1", heartbeat(4), t0).unwrap();
        let job = f.running(2, "n1").await;
        f.logs.append(job.id, "epoch 1\n".to_string()).unwrap();

        let report = f.monitor.sweep_at(t0 + TimeDelta::seconds(31)).await.unwrap();
        assert_eq!(report.lost, 1);

        let lost = f.jobs.get(job.id).await.unwrap();
        assert_eq!(lost.state, JobState::Lost);
        assert_eq!(lost.node_id, None);
        assert_eq!(f.gpu_free("n1"), 4);
        // output so far survives, followers learn the stream broke off
        assert_eq!(f.logs.fetch(job.id).unwrap(), "epoch 1\n");
    }

    #[tokio::test]
    async fn test_runtime_limit_fails_without_retry() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let mut req = submit_req(1, 1);
        req.max_runtime_minutes = 1;
        let job = f.jobs.submit(req, None).await.unwrap();
        f.place(&job, "n1").await;
        f.monitor
            .report(
                job.id,
                JobReport::Started {
                    node_id: "n1".to_string(),
                    attempt: None,
                },
            )
            .await
            .unwrap();

        let later = Utc::now() + TimeDelta::minutes(2);
        f.registry.heartbeat_at("n1", heartbeat(4), later).unwrap();
        let report = f.monitor.sweep_at(later).await.unwrap();
        assert_eq!(report.timed_out, 1);

        let failed = f.jobs.get(job.id).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert_eq!(failed.retry_count, 0);
        assert!(
            f.dispatcher
                .calls()
                .contains(&Call::Terminate("n1".to_string(), job.id))
        );
    }

    #[tokio::test]
    async fn test_stuck_launch_is_retried() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.jobs.submit(submit_req(2, 1), None).await.unwrap();
        f.place(&job, "n1").await;

        let later = Utc::now() + TimeDelta::minutes(3);
        f.registry.heartbeat_at("n1", heartbeat(4), later).unwrap();
        let report = f.monitor.sweep_at(later).await.unwrap();
        assert_eq!(report.launch_timeouts, 1);

        let requeued = f.jobs.get(job.id).await.unwrap();
        assert_eq!(requeued.state, JobState::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(f.gpu_free("n1"), 4);
    }

    #[tokio::test]
    async fn test_orphans_recovered_as_lost() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let orphan = f.jobs.submit(submit_req(1, 1), None).await.unwrap();
        // placed without a committed reservation, as after a restart
        f.jobs
            .transition(
                orphan.id,
                Transition::new(JobState::Queued, JobState::Starting).on_node("n1"),
            )
            .await
            .unwrap();
        let healthy = f.running(1, "n1").await;

        assert_eq!(f.monitor.recover_orphans().await.unwrap(), 1);
        assert_eq!(f.jobs.get(orphan.id).await.unwrap().state, JobState::Lost);
        assert_eq!(f.jobs.get(healthy.id).await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn test_release_wakes_scheduler() {
        let f = fixture();
        f.registry.heartbeat("n1", heartbeat(4)).unwrap();
        let job = f.running(1, "n1").await;

        let woken = f.trigger.notified();
        f.monitor.report(job.id, exited("n1", 0)).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), woken)
            .await
            .unwrap();
    }
}
