//! Dispatch
//!
//! Hand-off of jobs to the node agents that run them.

use async_trait::async_trait;
use gantry_client::{AgentClient, ClientError};
use gantry_core::domain::job::Job;
use gantry_core::domain::node::Node;
use gantry_core::dto::agent::LaunchRequest;
use thiserror::Error;
use uuid::Uuid;

/// Dispatch error type
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {node_id} unreachable: {source}")]
    NodeUnreachable {
        node_id: String,
        #[source]
        source: ClientError,
    },
}

impl DispatchError {
    /// The agent answered but does not know the job
    pub fn is_not_found(&self) -> bool {
        match self {
            DispatchError::NodeUnreachable { source, .. } => source.is_not_found(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Outbound side of the node agent protocol
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Ask `node` to start `job`; success means the agent accepted it
    async fn launch(&self, node: &Node, job: &Job) -> Result<()>;

    /// Ask `node` to stop `job_id`; success means the agent acknowledged it
    async fn terminate(&self, node: &Node, job_id: Uuid) -> Result<()>;
}

/// Dispatcher speaking HTTP to real node agents
pub struct AgentDispatcher {
    client: AgentClient,
}

impl AgentDispatcher {
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Dispatcher for AgentDispatcher {
    async fn launch(&self, node: &Node, job: &Job) -> Result<()> {
        self.client
            .launch(&node.addr, &LaunchRequest::from(job))
            .await
            .map_err(|source| DispatchError::NodeUnreachable {
                node_id: node.id.clone(),
                source,
            })
    }

    async fn terminate(&self, node: &Node, job_id: Uuid) -> Result<()> {
        self.client
            .terminate(&node.addr, job_id)
            .await
            .map_err(|source| DispatchError::NodeUnreachable {
                node_id: node.id.clone(),
                source,
            })
    }
}
