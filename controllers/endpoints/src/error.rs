//! Controller-specific error types.
//!
//! Errors raised during a reconciliation pass abort that pass; the key is
//! requeued with backoff and the next pass starts from scratch.

use connect_inject::InjectError;
use consul_client::ConsulError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Endpoints Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Consul agent API error
    #[error("Consul error: {0}")]
    Consul(#[from] ConsulError),

    /// Pod annotations could not be turned into registrations
    #[error("Registration error: {0}")]
    Inject(#[from] InjectError),

    /// Pod listed in an Endpoints object no longer exists
    #[error("Pod not found: {0}")]
    PodNotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
