//! ConsulClient trait for mocking
//!
//! This trait abstracts the Consul agent client so the reconciler can be
//! exercised against an in-memory agent in unit tests.

use crate::error::ConsulError;
use crate::models::*;
use std::collections::HashMap;

/// Trait for Consul agent API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ConsulClientTrait: Send + Sync {
    /// Address of the agent this client talks to
    fn address(&self) -> &str;

    /// Register (or re-register) a service instance with the agent.
    /// Registration is idempotent on the service ID.
    async fn service_register(&self, registration: &AgentServiceRegistration) -> Result<(), ConsulError>;

    /// Deregister a service instance by ID
    async fn service_deregister(&self, service_id: &str) -> Result<(), ConsulError>;

    /// List the agent's local service instances matching `filter`, keyed by service ID
    async fn services_with_filter(&self, filter: &ServiceFilter) -> Result<HashMap<String, AgentService>, ConsulError>;

    /// Read a `proxy-defaults` config entry.
    /// Returns `ConsulError::NotFound` when the entry does not exist.
    async fn proxy_defaults(&self, name: &str) -> Result<ProxyConfigEntry, ConsulError>;
}
