//! Mock ConsulClient for unit testing
//!
//! In-memory agent implementing `ConsulClientTrait`. Every call is recorded
//! so tests can assert which registrations and deregistrations a
//! reconciliation pass issued.

use crate::consul_trait::ConsulClientTrait;
use crate::error::ConsulError;
use crate::models::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A call made against the mock agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Register(String),
    Deregister(String),
    ListServices(String),
    ProxyDefaults(String),
}

#[derive(Debug, Clone)]
enum ProxyDefaultsState {
    Missing,
    Unreachable,
    Entry(ProxyConfigEntry),
}

/// Mock Consul agent for testing
#[derive(Debug, Clone)]
pub struct MockConsulClient {
    address: String,
    services: Arc<Mutex<HashMap<String, AgentServiceRegistration>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    proxy_defaults: Arc<Mutex<ProxyDefaultsState>>,
    fail_register: Arc<Mutex<bool>>,
}

impl MockConsulClient {
    /// Create a new mock agent with no services and no proxy-defaults entry
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            services: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            proxy_defaults: Arc::new(Mutex::new(ProxyDefaultsState::Missing)),
            fail_register: Arc::new(Mutex::new(false)),
        }
    }

    /// Seed a registration without recording a call (for test setup)
    pub fn add_service(&self, registration: AgentServiceRegistration) {
        self.services
            .lock()
            .unwrap()
            .insert(registration.id.clone(), registration);
    }

    /// Store a global proxy-defaults entry with the given mesh gateway mode
    pub fn set_mesh_gateway_mode(&self, mode: MeshGatewayMode) {
        *self.proxy_defaults.lock().unwrap() = ProxyDefaultsState::Entry(ProxyConfigEntry {
            kind: "proxy-defaults".to_string(),
            name: "global".to_string(),
            mesh_gateway: MeshGatewayConfig { mode },
        });
    }

    /// Make config entry reads fail as if the servers were unreachable
    pub fn set_config_unreachable(&self) {
        *self.proxy_defaults.lock().unwrap() = ProxyDefaultsState::Unreachable;
    }

    /// Make every registration fail
    pub fn fail_registrations(&self) {
        *self.fail_register.lock().unwrap() = true;
    }

    /// IDs of the services currently registered, sorted
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn service(&self, id: &str) -> Option<AgentServiceRegistration> {
        self.services.lock().unwrap().get(id).cloned()
    }

    /// All calls recorded so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Register(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn deregistered_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Deregister(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ConsulClientTrait for MockConsulClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn service_register(&self, registration: &AgentServiceRegistration) -> Result<(), ConsulError> {
        self.record(MockCall::Register(registration.id.clone()));
        if *self.fail_register.lock().unwrap() {
            return Err(ConsulError::Api {
                status: 500,
                body: "agent unavailable".to_string(),
            });
        }
        self.add_service(registration.clone());
        Ok(())
    }

    async fn service_deregister(&self, service_id: &str) -> Result<(), ConsulError> {
        self.record(MockCall::Deregister(service_id.to_string()));
        // The agent treats unknown IDs as already gone
        self.services.lock().unwrap().remove(service_id);
        Ok(())
    }

    async fn services_with_filter(&self, filter: &ServiceFilter) -> Result<HashMap<String, AgentService>, ConsulError> {
        self.record(MockCall::ListServices(filter.expression()));
        Ok(self
            .services
            .lock()
            .unwrap()
            .values()
            .map(AgentService::from)
            .filter(|service| filter.matches(service))
            .map(|service| (service.id.clone(), service))
            .collect())
    }

    async fn proxy_defaults(&self, name: &str) -> Result<ProxyConfigEntry, ConsulError> {
        self.record(MockCall::ProxyDefaults(name.to_string()));
        match &*self.proxy_defaults.lock().unwrap() {
            ProxyDefaultsState::Missing => Err(ConsulError::NotFound(format!(
                "Config entry not found for \"proxy-defaults\" / \"{}\"",
                name
            ))),
            ProxyDefaultsState::Unreachable => Err(ConsulError::Api {
                status: 503,
                body: "No cluster leader".to_string(),
            }),
            ProxyDefaultsState::Entry(entry) => Ok(entry.clone()),
        }
    }
}
