//! Gantry Agent Client
//!
//! A small, type-safe HTTP client the orchestrator uses to hand jobs to node agents.
//!
//! Node agents are external processes; this crate only knows their dispatch
//! surface: launching a job and terminating it.
//!
//! # Example
//!
//! ```no_run
//! use gantry_client::AgentClient;
//! use gantry_core::dto::agent::LaunchRequest;
//! use std::time::Duration;
//!
//! # async fn example(req: LaunchRequest) -> gantry_client::Result<()> {
//! let client = AgentClient::new(Duration::from_secs(5))?;
//! client.launch("10.0.0.7:9090", &req).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod jobs;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use std::time::Duration;

/// HTTP client for node agents
///
/// One client is shared for all nodes; the target agent is chosen per call
/// from the node's registered address.
#[derive(Debug, Clone)]
pub struct AgentClient {
    /// HTTP client instance
    client: Client,
}

impl AgentClient {
    /// Create a new agent client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Turn a node address into a base URL
    ///
    /// Bare `host:port` addresses are assumed to speak plain HTTP.
    fn agent_url(addr: &str) -> Result<String> {
        let addr = addr.trim().trim_end_matches('/');
        if addr.is_empty() {
            return Err(ClientError::InvalidAddress("empty address".to_string()));
        }

        if addr.starts_with("http://") || addr.starts_with("https://") {
            Ok(addr.to_string())
        } else {
            Ok(format!("http://{}", addr))
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an agent response that carries no payload we need
    ///
    /// This method checks the status code and returns an error if the request failed.
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
