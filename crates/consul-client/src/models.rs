//! Consul agent API models
//!
//! These models match the JSON bodies of the Consul agent endpoints
//! (`/v1/agent/service/register`, `/v1/agent/services`) and the
//! `/v1/config/proxy-defaults/<name>` config entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a registered service. Plain services carry no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Sidecar proxy fronting an application service
    #[serde(rename = "connect-proxy")]
    ConnectProxy,
}

/// Service registration sent to a local agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ServiceKind>,
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub port: i32,
    pub address: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<AgentServiceConnectProxyConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<AgentServiceCheck>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Proxy block of a `connect-proxy` registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceConnectProxyConfig {
    pub destination_service_name: String,
    #[serde(rename = "DestinationServiceID")]
    pub destination_service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_service_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_service_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<Upstream>,
}

/// Destination kind of an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamDestType {
    #[serde(rename = "service")]
    Service,
    #[serde(rename = "prepared_query")]
    PreparedQuery,
}

/// Upstream dependency of a sidecar proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Upstream {
    pub destination_type: UpstreamDestType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_namespace: String,
    pub destination_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datacenter: String,
    pub local_bind_port: i32,
}

/// Health check attached to a registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    pub name: String,
    #[serde(rename = "TCP", default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deregister_critical_service_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_service: Option<String>,
}

/// Service instance as reported by `/v1/agent/services`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl From<&AgentServiceRegistration> for AgentService {
    fn from(registration: &AgentServiceRegistration) -> Self {
        Self {
            id: registration.id.clone(),
            service: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            tags: (!registration.tags.is_empty()).then(|| registration.tags.clone()),
            meta: registration.meta.clone(),
        }
    }
}

/// Mesh gateway mode of a proxy-defaults entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshGatewayMode {
    #[default]
    #[serde(rename = "")]
    Default,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "remote")]
    Remote,
}

impl MeshGatewayMode {
    /// Wire representation of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshGatewayMode::Default => "",
            MeshGatewayMode::None => "none",
            MeshGatewayMode::Local => "local",
            MeshGatewayMode::Remote => "remote",
        }
    }
}

/// Mesh gateway block of a config entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeshGatewayConfig {
    #[serde(default)]
    pub mode: MeshGatewayMode,
}

/// `proxy-defaults` config entry (only the fields the controllers read)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyConfigEntry {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub mesh_gateway: MeshGatewayConfig,
}

/// Metadata equality filter for `/v1/agent/services`.
///
/// Clauses are AND-ed together. The agent evaluates the rendered expression;
/// the mock evaluates [`ServiceFilter::matches`] directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    meta: Vec<(String, String)>,
}

impl ServiceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `Meta[key] == value`
    #[must_use]
    pub fn meta_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.push((key.into(), value.into()));
        self
    }

    /// Render as a Consul filter expression, e.g.
    /// `Meta["k8s-service-name"] == "web" and Meta["k8s-namespace"] == "default"`
    pub fn expression(&self) -> String {
        self.meta
            .iter()
            .map(|(k, v)| format!("Meta[{:?}] == {:?}", k, v))
            .collect::<Vec<_>>()
            .join(" and ")
    }

    pub fn matches(&self, service: &AgentService) -> bool {
        self.meta
            .iter()
            .all(|(k, v)| service.meta.get(k).is_some_and(|actual| actual == v))
    }
}
