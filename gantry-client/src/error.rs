//! Error types for the agent client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to a node agent
#[derive(Debug, Error)]
pub enum ClientError {
    /// The agent could not be reached (connect failure, timeout, reset)
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The agent answered with an error status code
    #[error("Agent error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the agent
        message: String,
    },

    /// The node address cannot be turned into a URL
    #[error("Invalid agent address: {0}")]
    InvalidAddress(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if the request never got an answer from the agent
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::RequestFailed(_))
    }
}
