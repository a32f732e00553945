//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services coordinate the job store, the node registry and the node agents.

pub mod dispatch;
pub mod job;
pub mod log;
pub mod monitor;
pub mod scheduler;

// Re-export for convenience
pub use dispatch::{AgentDispatcher, DispatchError, Dispatcher};
pub use job::{JobError, JobService};
pub use log::{LogError, LogService};
pub use monitor::{LifecycleMonitor, MonitorConfig, SweepReport};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
