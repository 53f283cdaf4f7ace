//! Reconciliation logic for Endpoints objects.
//!
//! A pass registers every injected pod behind an Endpoints object with the
//! Consul agent on the pod's node, then sweeps all agents for instances of
//! the same Kubernetes service whose address is no longer listed. The first
//! error aborts the pass; re-registration and the address-based sweep are
//! both idempotent, so the next pass starts over safely.

use crate::agents::AgentClientFactory;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::lookup::KubeLookup;
use connect_inject::annotations::{has_been_injected, META_KEY_KUBE_NS, META_KEY_KUBE_SERVICE_NAME};
use connect_inject::{EndpointOwner, RegistrationBuilder};
use consul_client::{ConsulClientTrait, ServiceFilter};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

const TARGET_KIND_POD: &str = "Pod";

/// Reconciles Endpoints objects into Consul agent registrations.
pub struct Reconciler {
    config: Arc<ControllerConfig>,
    lookup: Arc<dyn KubeLookup>,
    agents: Arc<dyn AgentClientFactory>,
    /// Agent local to the controller, used for upstream mesh gateway checks
    consul: Arc<dyn ConsulClientTrait>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("consul", &self.consul.address())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler.
    pub fn new(
        config: Arc<ControllerConfig>,
        lookup: Arc<dyn KubeLookup>,
        agents: Arc<dyn AgentClientFactory>,
        consul: Arc<dyn ConsulClientTrait>,
    ) -> Self {
        Self {
            config,
            lookup,
            agents,
            consul,
        }
    }

    /// Run one reconciliation pass for the Endpoints object `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        if self.config.should_ignore(namespace) {
            debug!("Ignoring Endpoints {}/{}: namespace not connect-injected", namespace, name);
            return Ok(());
        }

        let Some(endpoints) = self.lookup.get_endpoints(namespace, name).await.map_err(|e| {
            error!("Failed to get Endpoints {}/{}: {}", namespace, name, e);
            ControllerError::Kube(e)
        })?
        else {
            info!("Endpoints {}/{} deleted, deregistering all its service instances", namespace, name);
            return self.deregister_service_on_all_agents(name, namespace, None).await;
        };

        debug!("Retrieved Endpoints {}/{}", namespace, name);
        let owner = EndpointOwner {
            name: name.to_string(),
            namespace: namespace.to_string(),
        };

        // Every pod IP in the object, ready or not. Instances at any other
        // address are swept below.
        let mut endpoint_addresses = HashSet::new();

        for subset in endpoints.subsets.iter().flatten() {
            let addresses = subset
                .addresses
                .iter()
                .flatten()
                .chain(subset.not_ready_addresses.iter().flatten());

            for address in addresses {
                let Some(target) = address
                    .target_ref
                    .as_ref()
                    .filter(|target| target.kind.as_deref() == Some(TARGET_KIND_POD))
                else {
                    continue;
                };
                endpoint_addresses.insert(address.ip.clone());

                let pod_namespace = target.namespace.as_deref().unwrap_or(namespace);
                let pod_name = target.name.as_deref().unwrap_or_default();
                let pod = self
                    .lookup
                    .get_pod(pod_namespace, pod_name)
                    .await
                    .map_err(|e| {
                        error!("Failed to get pod {}/{}: {}", pod_namespace, pod_name, e);
                        ControllerError::Kube(e)
                    })?
                    .ok_or_else(|| ControllerError::PodNotFound(format!("{}/{}", pod_namespace, pod_name)))?;

                if has_been_injected(&pod) {
                    self.register_pod(&pod, &owner).await?;
                }
            }
        }

        self.deregister_service_on_all_agents(name, namespace, Some(&endpoint_addresses))
            .await
            .inspect_err(|e| {
                error!(
                    "Failed to deregister service instances of {}/{} on all agents: {}",
                    namespace, name, e
                );
            })
    }

    /// Register the service and then its sidecar proxy with the agent on the pod's node.
    async fn register_pod(&self, pod: &Pod, owner: &EndpointOwner) -> Result<(), ControllerError> {
        let host_ip = pod
            .status
            .as_ref()
            .and_then(|status| status.host_ip.as_deref())
            .unwrap_or_default();
        let client = self.agents.client_for(host_ip).inspect_err(|e| {
            error!("Failed to create a Consul client for {}: {}", host_ip, e);
        })?;

        let registrations = RegistrationBuilder::new(self.consul.as_ref())
            .build(pod, owner)
            .await
            .inspect_err(|e| {
                error!("Failed to create service registrations for {}/{}: {}", owner.namespace, owner.name, e);
            })?;

        info!("Registering service {} ({})", registrations.service.name, registrations.service.id);
        client.service_register(&registrations.service).await.inspect_err(|e| {
            error!("Failed to register service {} with Consul: {}", registrations.service.name, e);
        })?;

        info!("Registering proxy service {} ({})", registrations.proxy.name, registrations.proxy.id);
        client.service_register(&registrations.proxy).await.inspect_err(|e| {
            error!("Failed to register proxy service {} with Consul: {}", registrations.proxy.name, e);
        })?;

        Ok(())
    }

    /// Deregister instances of `k8s_service_name` in `k8s_namespace` from every agent.
    ///
    /// With `endpoint_addresses` only instances whose address is absent from
    /// the set are removed; without it every instance goes. Instances are
    /// found by metadata, so they are cleaned up even when the Consul service
    /// name was overridden by annotation.
    pub async fn deregister_service_on_all_agents(
        &self,
        k8s_service_name: &str,
        k8s_namespace: &str,
        endpoint_addresses: Option<&HashSet<String>>,
    ) -> Result<(), ControllerError> {
        let selector = format!("component=client,app=consul,release={}", self.config.release_name);
        let agent_pods = self
            .lookup
            .list_pods(&self.config.release_namespace, &selector)
            .await?;

        let filter = ServiceFilter::new()
            .meta_eq(META_KEY_KUBE_SERVICE_NAME, k8s_service_name)
            .meta_eq(META_KEY_KUBE_NS, k8s_namespace);

        for agent in &agent_pods {
            let agent_ip = agent
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.as_deref())
                .unwrap_or_default();
            let client = self.agents.client_for(agent_ip)?;

            let services = client.services_with_filter(&filter).await.inspect_err(|e| {
                error!("Failed to get service instances of {} from {}: {}", k8s_service_name, agent_ip, e);
            })?;

            for (service_id, service) in services {
                let stale = endpoint_addresses.is_none_or(|addresses| !addresses.contains(&service.address));
                if !stale {
                    continue;
                }
                info!("Deregistering service instance {} from agent {}", service_id, agent_ip);
                client.service_deregister(&service_id).await.inspect_err(|e| {
                    error!("Failed to deregister service instance {}: {}", service_id, e);
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
