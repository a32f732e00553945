//! Job-related agent endpoints

use crate::AgentClient;
use crate::error::Result;
use gantry_core::dto::agent::LaunchRequest;
use uuid::Uuid;

impl AgentClient {
    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Ask the agent at `addr` to start a job's process
    ///
    /// A 2xx answer only means the agent accepted the job; the process start
    /// itself is reported back asynchronously.
    pub async fn launch(&self, addr: &str, req: &LaunchRequest) -> Result<()> {
        let url = format!("{}/jobs", Self::agent_url(addr)?);
        tracing::debug!("Launching job {} via {}", req.job_id, url);

        let response = self.client.post(&url).json(req).send().await?;

        self.handle_empty_response(response).await
    }

    /// Ask the agent at `addr` to terminate a job's process
    ///
    /// A 2xx answer acknowledges the termination.
    pub async fn terminate(&self, addr: &str, job_id: Uuid) -> Result<()> {
        let url = format!("{}/jobs/{}/terminate", Self::agent_url(addr)?, job_id);
        tracing::debug!("Terminating job {} via {}", job_id, url);

        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
