//! Orchestrator wiring
//!
//! Builds the services around a job store and a dispatcher, hands them to the
//! HTTP router and runs the two background loops.

use axum::Router;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::api::{self, AppState, auth::IdentityProvider};
use crate::config::Config;
use crate::registry::NodeRegistry;
use crate::repository::JobStore;
use crate::service::{Dispatcher, JobService, LifecycleMonitor, LogService, Scheduler};

pub struct Orchestrator {
    jobs: Arc<JobService>,
    registry: Arc<NodeRegistry>,
    logs: Arc<LogService>,
    monitor: Arc<LifecycleMonitor>,
    scheduler: Arc<Scheduler>,
    trigger: Arc<Notify>,
    identities: Arc<dyn IdentityProvider>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        identities: Arc<dyn IdentityProvider>,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let jobs = Arc::new(JobService::new(store, config.max_gpus_per_job));
        let registry = Arc::new(NodeRegistry::new(
            config.node_liveness(),
            config.node_down(),
        ));
        let logs = Arc::new(LogService::new(config.max_log_chunk_bytes));

        let monitor = Arc::new(LifecycleMonitor::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            Arc::clone(&logs),
            Arc::clone(&dispatcher),
            Arc::clone(&trigger),
            config.monitor(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            dispatcher,
            Arc::clone(&monitor),
            Arc::clone(&trigger),
            config.scheduler(),
        ));

        Self {
            jobs,
            registry,
            logs,
            monitor,
            scheduler,
            trigger,
            identities,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<LifecycleMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The HTTP API over this orchestrator's services; streaming responses
    /// end when `shutdown` flips to `true`
    pub fn router(&self, shutdown: watch::Receiver<bool>) -> Router {
        api::create_router(AppState {
            jobs: Arc::clone(&self.jobs),
            registry: Arc::clone(&self.registry),
            logs: Arc::clone(&self.logs),
            monitor: Arc::clone(&self.monitor),
            trigger: Arc::clone(&self.trigger),
            identities: Arc::clone(&self.identities),
            shutdown,
        })
    }

    /// Starts the scheduler and the lifecycle monitor; both stop when
    /// `shutdown` changes
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.scheduler).run(shutdown.clone())),
            tokio::spawn(Arc::clone(&self.monitor).run(shutdown)),
        ]
    }
}
