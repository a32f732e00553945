//! Orchestrator configuration
//!
//! Every option is a command-line flag with a `GANTRY_*` environment
//! fallback. Thresholds and intervals are whole seconds.

use chrono::TimeDelta;
use clap::Parser;
use std::time::Duration;

use crate::service::{MonitorConfig, SchedulerConfig};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_TICK_INTERVAL_SECS: u64 = 2;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_NODE_LIVENESS_SECS: u64 = 30;
const DEFAULT_NODE_DOWN_SECS: u64 = 300;
const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CANCEL_GRACE_SECS: u64 = 30;
const DEFAULT_UNSCHEDULABLE_AFTER_TICKS: u32 = 30;
const DEFAULT_MAX_GPUS_PER_JOB: u32 = 64;
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_LOG_CHUNK_BYTES: usize = 1024 * 1024;

/// Orchestrator configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "gantry-orchestrator")]
#[command(about = "Gantry GPU cluster control plane", long_about = None)]
pub struct Config {
    /// Address the HTTP API listens on
    #[arg(long, env = "GANTRY_BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind_addr: String,

    /// PostgreSQL URL; jobs are kept in memory when absent
    #[arg(long, env = "GANTRY_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Accepted bearer tokens as `token=id:name`, comma separated
    #[arg(long, env = "GANTRY_API_TOKENS", value_delimiter = ',', hide_env_values = true)]
    pub api_tokens: Vec<String>,

    /// Seconds between scheduling passes when nothing wakes the scheduler
    #[arg(long, env = "GANTRY_TICK_INTERVAL", default_value_t = DEFAULT_TICK_INTERVAL_SECS)]
    pub tick_interval: u64,

    /// Seconds between lifecycle sweeps
    #[arg(long, env = "GANTRY_SWEEP_INTERVAL", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval: u64,

    /// Heartbeat age after which a node is OFFLINE and its jobs LOST
    #[arg(long, env = "GANTRY_NODE_LIVENESS", default_value_t = DEFAULT_NODE_LIVENESS_SECS)]
    pub node_liveness: u64,

    /// Heartbeat age after which a node is DOWN
    #[arg(long, env = "GANTRY_NODE_DOWN", default_value_t = DEFAULT_NODE_DOWN_SECS)]
    pub node_down: u64,

    /// Seconds a job may stay STARTING before the launch counts as failed
    #[arg(long, env = "GANTRY_LAUNCH_TIMEOUT", default_value_t = DEFAULT_LAUNCH_TIMEOUT_SECS)]
    pub launch_timeout: u64,

    /// Seconds a cancel waits for the node to confirm termination
    #[arg(long, env = "GANTRY_CANCEL_GRACE", default_value_t = DEFAULT_CANCEL_GRACE_SECS)]
    pub cancel_grace: u64,

    /// Scheduling passes a job may exceed every node's GPU count before it fails
    #[arg(
        long,
        env = "GANTRY_UNSCHEDULABLE_AFTER_TICKS",
        default_value_t = DEFAULT_UNSCHEDULABLE_AFTER_TICKS
    )]
    pub unschedulable_after_ticks: u32,

    /// Automatic re-queues after a failed launch or run
    #[arg(long, env = "GANTRY_RETRY_LIMIT", default_value_t = gantry_core::domain::job::DEFAULT_RETRY_LIMIT)]
    pub retry_limit: u32,

    /// Largest gpu_count a single job may request
    #[arg(long, env = "GANTRY_MAX_GPUS_PER_JOB", default_value_t = DEFAULT_MAX_GPUS_PER_JOB)]
    pub max_gpus_per_job: u32,

    /// Seconds before a request to a node agent gives up
    #[arg(long, env = "GANTRY_AGENT_TIMEOUT", default_value_t = DEFAULT_AGENT_TIMEOUT_SECS)]
    pub agent_timeout: u64,

    /// Largest log chunk a node agent may push at once
    #[arg(long, env = "GANTRY_MAX_LOG_CHUNK_BYTES", default_value_t = DEFAULT_MAX_LOG_CHUNK_BYTES)]
    pub max_log_chunk_bytes: usize,
}

impl Config {
    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.trim().is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.api_tokens.is_empty() {
            anyhow::bail!("at least one API token is required");
        }

        let intervals = [
            ("tick_interval", self.tick_interval),
            ("sweep_interval", self.sweep_interval),
            ("node_liveness", self.node_liveness),
            ("launch_timeout", self.launch_timeout),
            ("cancel_grace", self.cancel_grace),
            ("agent_timeout", self.agent_timeout),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.node_down <= self.node_liveness {
            anyhow::bail!(
                "node_down ({}s) must exceed node_liveness ({}s)",
                self.node_down,
                self.node_liveness
            );
        }

        if self.unschedulable_after_ticks == 0 {
            anyhow::bail!("unschedulable_after_ticks must be greater than 0");
        }

        if self.max_gpus_per_job == 0 {
            anyhow::bail!("max_gpus_per_job must be greater than 0");
        }

        if self.max_log_chunk_bytes == 0 {
            anyhow::bail!("max_log_chunk_bytes must be greater than 0");
        }

        Ok(())
    }

    pub fn node_liveness(&self) -> Duration {
        Duration::from_secs(self.node_liveness)
    }

    pub fn node_down(&self) -> Duration {
        Duration::from_secs(self.node_down)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval),
            unschedulable_after_ticks: self.unschedulable_after_ticks,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval),
            launch_timeout: Duration::from_secs(self.launch_timeout),
            cancel_grace: Duration::from_secs(self.cancel_grace),
            retry_limit: self.retry_limit,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_url: None,
            api_tokens: Vec::new(),
            tick_interval: DEFAULT_TICK_INTERVAL_SECS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            node_liveness: DEFAULT_NODE_LIVENESS_SECS,
            node_down: DEFAULT_NODE_DOWN_SECS,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT_SECS,
            cancel_grace: DEFAULT_CANCEL_GRACE_SECS,
            unschedulable_after_ticks: DEFAULT_UNSCHEDULABLE_AFTER_TICKS,
            retry_limit: gantry_core::domain::job::DEFAULT_RETRY_LIMIT,
            max_gpus_per_job: DEFAULT_MAX_GPUS_PER_JOB,
            agent_timeout: DEFAULT_AGENT_TIMEOUT_SECS,
            max_log_chunk_bytes: DEFAULT_MAX_LOG_CHUNK_BYTES,
        }
    }
}

/// Converts a std duration to a chrono delta, saturating on overflow
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
