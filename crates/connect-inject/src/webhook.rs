//! Injector-wide configuration shared by every synthesized init container

use crate::env::{EnvSource, ProcessEnv};
use crate::metrics::MetricsConfig;
use k8s_openapi::api::core::v1::ResourceRequirements;
use std::sync::Arc;
use std::time::Duration;

const DNS_SERVICE_HOST_ENV_SUFFIX: &str = "DNS_SERVICE_HOST";

/// Global mesh injection settings
#[derive(Debug, Clone)]
pub struct MeshWebhook {
    /// Image providing the `consul` binary (copy container)
    pub image_consul: String,
    /// Image providing `consul-k8s-control-plane` (init container)
    pub image_consul_k8s: String,

    /// ACL auth method used by connect-init to log in; `None` disables ACL login
    pub auth_method: Option<String>,
    /// Admin partition; `None` when partitions are not in use
    pub consul_partition: Option<String>,

    pub enable_namespaces: bool,
    /// Consul namespace services land in when mirroring is off
    pub consul_destination_namespace: String,
    pub enable_k8s_ns_mirroring: bool,
    pub k8s_ns_mirroring_prefix: String,

    /// PEM CA certificate of the Consul agents; enables https
    pub consul_ca_cert: Option<String>,

    pub enable_transparent_proxy: bool,
    /// Traffic redirection is done by the CNI plugin instead of the init container
    pub enable_cni: bool,
    pub enable_consul_dns: bool,
    pub enable_openshift: bool,

    /// Helm resource prefix, used to find the DNS service's env variable
    pub resource_prefix: String,
    /// Rendered into `-consul-api-timeout`
    pub consul_api_timeout: Duration,
    pub init_container_resources: ResourceRequirements,
    pub metrics_config: MetricsConfig,

    /// Where `<PREFIX>_DNS_SERVICE_HOST` is looked up
    pub env: Arc<dyn EnvSource>,
}

impl Default for MeshWebhook {
    fn default() -> Self {
        Self {
            image_consul: String::new(),
            image_consul_k8s: String::new(),
            auth_method: None,
            consul_partition: None,
            enable_namespaces: false,
            consul_destination_namespace: String::new(),
            enable_k8s_ns_mirroring: false,
            k8s_ns_mirroring_prefix: String::new(),
            consul_ca_cert: None,
            enable_transparent_proxy: false,
            enable_cni: false,
            enable_consul_dns: false,
            enable_openshift: false,
            resource_prefix: String::new(),
            consul_api_timeout: Duration::ZERO,
            init_container_resources: ResourceRequirements::default(),
            metrics_config: MetricsConfig::default(),
            env: Arc::new(ProcessEnv),
        }
    }
}

impl MeshWebhook {
    /// Consul namespace for services in `k8s_namespace`; empty when
    /// namespaces are disabled.
    pub fn consul_namespace(&self, k8s_namespace: &str) -> String {
        if !self.enable_namespaces {
            return String::new();
        }
        if self.enable_k8s_ns_mirroring {
            format!("{}{}", self.k8s_ns_mirroring_prefix, k8s_namespace)
        } else {
            self.consul_destination_namespace.clone()
        }
    }

    /// Name of the env variable holding the DNS service cluster IP, e.g.
    /// `consul-dc1` becomes `CONSUL_DC1_DNS_SERVICE_HOST`.
    pub fn dns_service_host_name(&self) -> String {
        let prefix = self.resource_prefix.to_uppercase().replace('-', "_");
        format!("{prefix}_{DNS_SERVICE_HOST_ENV_SUFFIX}")
    }

    /// Partition, treating an empty string as unset
    pub(crate) fn partition(&self) -> Option<String> {
        self.consul_partition.clone().filter(|p| !p.is_empty())
    }

    pub(crate) fn auth_method(&self) -> Option<&str> {
        self.auth_method.as_deref().filter(|m| !m.is_empty())
    }

    pub(crate) fn ca_cert(&self) -> Option<String> {
        self.consul_ca_cert.clone().filter(|c| !c.is_empty())
    }
}
