//! Main controller implementation.
//!
//! Wires the Endpoints watcher to a single worker through the work queue.
//! The worker runs one pass per key, so passes for the same Endpoints
//! object never overlap. A failed pass requeues its key with a per-key
//! Fibonacci backoff.

use crate::agents::ConsulAgentFactory;
use crate::backoff::KeyedBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::lookup::KubeApiLookup;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::watcher::{split_key, Watcher};
use k8s_openapi::api::core::v1::Endpoints;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requeue delays in minutes: 1, 1, 2, 3, 5, 8, 10
const BACKOFF_MIN_MINUTES: u64 = 1;
const BACKOFF_MAX_MINUTES: u64 = 10;

/// Drains the work queue, one reconciliation pass at a time.
#[derive(Debug)]
pub struct Worker {
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    backoff: KeyedBackoff,
}

impl Worker {
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            queue,
            reconciler,
            backoff: KeyedBackoff::new(BACKOFF_MIN_MINUTES, BACKOFF_MAX_MINUTES),
        }
    }

    /// Process keys until the queue shuts down
    pub async fn run(mut self) {
        info!("Reconciliation worker started");
        while self.process_next().await {}
        info!("Reconciliation worker stopped");
    }

    /// Run a pass for the next key. Returns `false` once the queue is shut down.
    pub async fn process_next(&mut self) -> bool {
        let Some(key) = self.queue.next().await else {
            return false;
        };
        let Some((namespace, name)) = split_key(&key) else {
            warn!("Dropping malformed key {:?}", key);
            return true;
        };

        match self.reconciler.reconcile(namespace, name).await {
            Ok(()) => {
                debug!("Reconciled Endpoints {}", key);
                self.backoff.reset(&key);
            }
            Err(e) => {
                let delay = self.backoff.next_backoff(&key);
                error!(
                    "Failed to reconcile Endpoints {}: {} (retrying in {}s)",
                    key,
                    e,
                    delay.as_secs()
                );
                self.queue.requeue_after(key, delay);
            }
        }
        true
    }
}

/// Main controller for Endpoints registration.
#[derive(Debug)]
pub struct Controller {
    queue: Arc<WorkQueue>,
    endpoints_watcher: JoinHandle<Result<(), ControllerError>>,
    worker: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Endpoints Controller");

        let kube_client = Client::try_default().await?;

        let agents = Arc::new(ConsulAgentFactory::new(&config));
        let consul = Arc::new(agents.global_client(&config.consul_http_addr)?);

        let endpoints_api: Api<Endpoints> = match config.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(kube_client.clone(), namespace),
            None => Api::all(kube_client.clone()),
        };

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(config),
            Arc::new(KubeApiLookup::new(kube_client)),
            agents,
            consul,
        ));

        let queue = Arc::new(WorkQueue::new());
        let watcher = Watcher::new(Arc::clone(&queue), endpoints_api);

        let endpoints_watcher = tokio::spawn(async move { watcher.watch_endpoints().await });
        let worker = tokio::spawn(Worker::new(Arc::clone(&queue), reconciler).run());

        Ok(Self {
            queue,
            endpoints_watcher,
            worker,
        })
    }

    /// Runs until the watcher fails, the worker exits or the process is interrupted.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Endpoints Controller running");

        tokio::select! {
            result = &mut self.endpoints_watcher => {
                self.shutdown_queue();
                result
                    .map_err(|e| ControllerError::Watch(format!("Endpoints watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Endpoints watcher error: {}", e)))?;
            }
            result = &mut self.worker => {
                result.map_err(|e| ControllerError::Watch(format!("Reconciliation worker panicked: {}", e)))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                self.shutdown_queue();
                self.endpoints_watcher.abort();
                if let Err(e) = (&mut self.worker).await {
                    warn!("Reconciliation worker did not stop cleanly: {}", e);
                }
            }
        }

        Ok(())
    }

    fn shutdown_queue(&self) {
        let dropped = self.queue.shutdown();
        if dropped > 0 {
            info!("Dropped {} queued Endpoints keys on shutdown", dropped);
        }
    }
}
