//! Kubernetes reads needed by a reconciliation pass.
//!
//! The reconciler only reads from Kubernetes: the Endpoints object being
//! reconciled, the pods behind its addresses and the Consul client agent
//! pods. [`KubeLookup`] abstracts those reads so the reconciler can be
//! tested against [`InMemoryLookup`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::api::ListParams;
use kube::{Api, Client};

/// Object store reads used by the reconciler
#[async_trait]
pub trait KubeLookup: Send + Sync {
    /// Get an Endpoints object, `None` if it does not exist
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, kube::Error>;

    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error>;

    /// List pods in `namespace` matching `label_selector`
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error>;
}

/// [`KubeLookup`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeApiLookup {
    client: Client,
}

impl std::fmt::Debug for KubeApiLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeApiLookup").finish_non_exhaustive()
    }
}

impl KubeApiLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeLookup for KubeApiLookup {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, kube::Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(pods.items)
    }
}

#[cfg(test)]
pub use in_memory::InMemoryLookup;
