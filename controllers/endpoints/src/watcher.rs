//! Kubernetes resource watchers.
//!
//! Watches Endpoints objects and turns every change into a reconciliation
//! key on the work queue. Deletes are queued too: the pass finds the object
//! gone and deregisters its instances.

use crate::error::ControllerError;
use crate::queue::WorkQueue;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::Api;
use kube_runtime::watcher;
use std::sync::Arc;
use tracing::{debug, info};

/// `namespace/name` key of an Endpoints object
pub fn object_key(endpoints: &Endpoints) -> Option<String> {
    let name = endpoints.metadata.name.as_deref()?;
    let namespace = endpoints.metadata.namespace.as_deref().unwrap_or("default");
    Some(format!("{}/{}", namespace, name))
}

/// Split a key back into namespace and name
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
        .filter(|(namespace, name)| !namespace.is_empty() && !name.is_empty())
}

/// Watches Endpoints objects and feeds the work queue.
pub struct Watcher {
    queue: Arc<WorkQueue>,
    endpoints_api: Api<Endpoints>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("queue", &self.queue).finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(queue: Arc<WorkQueue>, endpoints_api: Api<Endpoints>) -> Self {
        Self { queue, endpoints_api }
    }

    fn enqueue(&self, endpoints: &Endpoints) {
        if let Some(key) = object_key(endpoints) {
            self.queue.add(key);
        }
    }

    /// Starts watching Endpoints resources.
    pub async fn watch_endpoints(&self) -> Result<(), ControllerError> {
        info!("Starting Endpoints watcher");

        let mut stream = Box::pin(watcher(self.endpoints_api.clone(), watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
        {
            match event {
                watcher::Event::Apply(endpoints) => {
                    let name = endpoints.metadata.name.as_deref().unwrap_or("<unknown>");
                    debug!("Endpoints applied: {}", name);
                    self.enqueue(&endpoints);
                }
                watcher::Event::Delete(endpoints) => {
                    let name = endpoints.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!("Endpoints deleted: {}", name);
                    self.enqueue(&endpoints);
                }
                watcher::Event::Init => {
                    info!("Endpoints watcher initialized");
                }
                watcher::Event::InitApply(endpoints) => {
                    let name = endpoints.metadata.name.as_deref().unwrap_or("<unknown>");
                    debug!("Endpoints init apply: {}", name);
                    self.enqueue(&endpoints);
                }
                watcher::Event::InitDone => {
                    info!("Endpoints watcher initialization complete ({} keys queued)", self.queue.len());
                }
            }
        }

        Ok(())
    }
}
