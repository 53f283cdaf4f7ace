//! Clients for the Consul agents running on each node.
//!
//! Service instances are registered with the agent on the pod's host, so a
//! pass talks to as many agents as there are nodes behind the Endpoints
//! object. Clients are cached per address and reused across passes; a
//! client left idle for [`CLIENT_IDLE_TIMEOUT`] is dropped so nodes that
//! leave the cluster do not pin clients forever.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use consul_client::{ConsulClient, ConsulClientConfig, ConsulClientTrait};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cached agent clients unused for this long are evicted
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Hands out a client for the agent listening on a node or pod IP
pub trait AgentClientFactory: Send + Sync {
    fn client_for(&self, ip: &str) -> Result<Arc<dyn ConsulClientTrait>, ControllerError>;
}

/// `scheme://ip:port` of an agent
pub fn agent_address(scheme: &str, ip: &str, port: u16) -> String {
    format!("{scheme}://{ip}:{port}")
}

#[derive(Debug)]
struct CachedClient {
    client: Arc<ConsulClient>,
    last_used: Instant,
}

/// [`AgentClientFactory`] building real HTTP clients
#[derive(Debug)]
pub struct ConsulAgentFactory {
    scheme: String,
    port: u16,
    token: Option<String>,
    ca_cert: Option<String>,
    idle_timeout: Duration,
    clients: Mutex<HashMap<String, CachedClient>>,
}

impl ConsulAgentFactory {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            scheme: config.consul_scheme.clone(),
            port: config.consul_port,
            token: config.consul_token.clone(),
            ca_cert: config.consul_ca_cert.clone(),
            idle_timeout: CLIENT_IDLE_TIMEOUT,
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[cfg(test)]
    pub fn cached_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn client_config(&self, address: String) -> ConsulClientConfig {
        let mut config = ConsulClientConfig::new(address);
        config.token = self.token.clone();
        config.ca_cert_pem = self.ca_cert.clone();
        config
    }

    /// Client for the agent local to the controller, used for config entry reads
    pub fn global_client(&self, address: &str) -> Result<ConsulClient, ControllerError> {
        Ok(ConsulClient::new(self.client_config(address.to_string()))?)
    }
}

impl AgentClientFactory for ConsulAgentFactory {
    fn client_for(&self, ip: &str) -> Result<Arc<dyn ConsulClientTrait>, ControllerError> {
        let address = agent_address(&self.scheme, ip, self.port);
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        let before = clients.len();
        clients.retain(|cached_address, cached| {
            *cached_address == address || now.duration_since(cached.last_used) < self.idle_timeout
        });
        if clients.len() < before {
            debug!("Evicted {} idle Consul agent clients", before - clients.len());
        }

        if let Some(cached) = clients.get_mut(&address) {
            cached.last_used = now;
            return Ok(Arc::clone(&cached.client) as Arc<dyn ConsulClientTrait>);
        }

        debug!("Creating Consul client for agent {}", address);
        let client = Arc::new(ConsulClient::new(self.client_config(address.clone()))?);
        clients.insert(
            address,
            CachedClient {
                client: Arc::clone(&client),
                last_used: now,
            },
        );
        Ok(client as Arc<dyn ConsulClientTrait>)
    }
}

#[cfg(test)]
pub use mock::MockAgentFactory;
