//! Consul client errors

use thiserror::Error;

/// Errors that can occur when talking to a Consul agent
#[derive(Debug, Error)]
pub enum ConsulError {
    /// HTTP request/response error (connection refused, timeout, TLS)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Consul returned a non-success status
    #[error("Unexpected response code: {status} ({body})")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, as returned by the agent
        body: String,
    },

    /// Consul returned 404 for the requested object
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client could not be built from the given settings
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl ConsulError {
    /// True when Consul definitively answered that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConsulError::NotFound(_))
    }
}
