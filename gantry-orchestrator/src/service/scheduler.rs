//! Scheduler
//!
//! Places queued jobs on nodes with enough free GPUs.
//!
//! Each tick walks the queue by priority (highest first) and submission
//! order, placing every job that fits somewhere. A job that does not fit is
//! skipped, never waited on, so a large job cannot hold back smaller ones
//! behind it. Launch requests for the jobs placed in a tick go out
//! concurrently once the whole queue has been walked.

use futures::future::join_all;
use gantry_core::domain::job::{Job, JobState};
use gantry_core::domain::node::Node;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::NodeRegistry;
use crate::repository::Transition;
use crate::service::dispatch::Dispatcher;
use crate::service::job::{JobService, Result};
use crate::service::monitor::LifecycleMonitor;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Ticks a job may exceed every node's GPU count before it is failed
    pub unschedulable_after_ticks: u32,
}

/// Outcome of one scheduling pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs placed and accepted by their node agent
    pub scheduled: Vec<Uuid>,
    /// Queued jobs left waiting for capacity
    pub deferred: usize,
    pub unschedulable: Vec<Uuid>,
    /// Jobs placed but returned to the queue because dispatch failed
    pub dispatch_failures: Vec<Uuid>,
}

impl TickReport {
    /// Nothing happened beyond jobs continuing to wait
    pub fn is_idle(&self) -> bool {
        self.scheduled.is_empty()
            && self.unschedulable.is_empty()
            && self.dispatch_failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    unschedulable_ticks: u32,
    dispatch_failures: u32,
}

pub struct Scheduler {
    jobs: Arc<JobService>,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    monitor: Arc<LifecycleMonitor>,
    trigger: Arc<Notify>,
    config: SchedulerConfig,
    /// Per queued job bookkeeping, pruned once the job leaves the queue
    counters: Mutex<HashMap<Uuid, Counters>>,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<JobService>,
        registry: Arc<NodeRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        monitor: Arc<LifecycleMonitor>,
        trigger: Arc<Notify>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            registry,
            dispatcher,
            monitor,
            trigger,
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<Uuid, Counters>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Failed dispatch hand-offs of a job since it was last seen queued
    pub fn dispatch_failures(&self, job_id: Uuid) -> u32 {
        self.counters()
            .get(&job_id)
            .map(|c| c.dispatch_failures)
            .unwrap_or(0)
    }

    /// Runs one scheduling pass
    pub async fn tick(&self) -> Result<TickReport> {
        let mut queued = self.jobs.list_in_states(&[JobState::Queued]).await?;
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let seen: HashSet<Uuid> = queued.iter().map(|j| j.id).collect();
        // no nodes means no evidence that a job can never fit
        let largest_node = self.registry.max_gpu_count();
        let mut report = TickReport::default();
        let mut placements = Vec::new();

        for job in queued {
            if let Some(max) = largest_node.filter(|max| job.gpu_count > *max) {
                if self.unschedulable(&job, max).await {
                    report.unschedulable.push(job.id);
                } else {
                    report.deferred += 1;
                }
                continue;
            }
            if let Some(counters) = self.counters().get_mut(&job.id) {
                counters.unschedulable_ticks = 0;
            }

            match self.place(&job).await {
                Ok(Some(placement)) => placements.push(placement),
                Ok(None) => report.deferred += 1,
                Err(e) => error!("Failed to place job {}: {}", job.id, e),
            }
        }

        let launches = placements.iter().map(|(node, job)| async move {
            (node, job, self.dispatcher.launch(node, job).await)
        });
        for (node, job, result) in join_all(launches).await {
            match result {
                Ok(()) => {
                    debug!("Job {} dispatched to {}", job.id, node.id);
                    report.scheduled.push(job.id);
                }
                Err(e) => {
                    warn!("Dispatch of job {} to {} failed: {}", job.id, node.id, e);
                    self.counters().entry(job.id).or_default().dispatch_failures += 1;
                    report.dispatch_failures.push(job.id);

                    let reason = format!("dispatch to {} failed", node.id);
                    match self.monitor.requeue_undispatched(job.id, &reason).await {
                        Ok(_) => {}
                        Err(e) if e.is_conflict() => {
                            debug!("Job {} moved on before it could be re-queued", job.id);
                        }
                        Err(e) => error!("Failed to re-queue job {}: {}", job.id, e),
                    }
                }
            }
        }

        self.counters().retain(|id, _| seen.contains(id));
        Ok(report)
    }

    /// Counts a tick in which `job` fit nowhere; fails it once the bound is hit.
    ///
    /// Returns whether the job was failed.
    async fn unschedulable(&self, job: &Job, largest_node: u32) -> bool {
        let ticks = {
            let mut counters = self.counters();
            let counters = counters.entry(job.id).or_default();
            counters.unschedulable_ticks += 1;
            counters.unschedulable_ticks
        };
        if ticks < self.config.unschedulable_after_ticks {
            debug!(
                "Job {} needs {} GPUs, largest node has {} ({} ticks)",
                job.id, job.gpu_count, largest_node, ticks
            );
            return false;
        }

        let reason = format!(
            "unschedulable: needs {} GPUs, largest node has {}",
            job.gpu_count, largest_node
        );
        match self.monitor.fail_unschedulable(job.id, &reason).await {
            Ok(_) => {
                warn!("Job {} {}", job.id, reason);
                true
            }
            Err(e) => {
                debug!("Could not fail job {} as unschedulable: {}", job.id, e);
                false
            }
        }
    }

    /// Reserves GPUs for `job` on the node with the most free GPUs and moves
    /// it to STARTING.
    ///
    /// Returns `None` when no node has room or the job left the queue.
    async fn place(&self, job: &Job) -> Result<Option<(Node, Job)>> {
        let candidates = self
            .registry
            .list_available()
            .into_iter()
            .filter(|n| n.gpu_free >= job.gpu_count);

        for node in candidates {
            let reservation = match self.registry.reserve(&node.id, job.id, job.gpu_count) {
                Ok(reservation) => reservation,
                Err(e) => {
                    // the node changed since it was listed
                    debug!("Cannot reserve on {} for job {}: {}", node.id, job.id, e);
                    continue;
                }
            };
            // in the ledger before the job is STARTING, so any path that
            // moves the job out again finds the reservation to release
            if let Err(e) = self.registry.commit(reservation) {
                error!("Cannot commit reservation of job {}: {}", job.id, e);
                return Ok(None);
            }

            let change = Transition::new(JobState::Queued, JobState::Starting)
                .on_node(node.id.as_str())
                .with_reason(format!("placed on {}", node.id));
            return match self.jobs.transition(job.id, change).await {
                Ok(placed) => {
                    info!(
                        "Job {} placed on {} ({} GPUs)",
                        job.id, node.id, job.gpu_count
                    );
                    Ok(Some((node, placed)))
                }
                Err(e) => {
                    if let Err(release) = self.registry.release_job(job.id) {
                        error!("Failed to release reservation of job {}: {}", job.id, release);
                    }
                    if e.is_conflict() {
                        debug!("Job {} left the queue before placement", job.id);
                        Ok(None)
                    } else {
                        Err(e)
                    }
                }
            };
        }

        Ok(None)
    }

    // =============================================================================
    // Background Loop
    // =============================================================================

    /// Schedules on every tick and whenever woken, until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting scheduler (interval: {:?})",
            self.config.tick_interval
        );

        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.trigger.notified() => debug!("Scheduler woken"),
                _ = shutdown.changed() => break,
            }

            match self.tick().await {
                Ok(report) if !report.is_idle() => info!("Scheduling tick: {:?}", report),
                Ok(_) => {}
                Err(e) => error!("Error during scheduling tick: {}", e),
            }
        }

        info!("Scheduler stopped");
    }
}
