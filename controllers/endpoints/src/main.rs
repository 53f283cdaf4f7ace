//! Endpoints Controller
//!
//! Keeps Consul agent service registrations in sync with Kubernetes
//! Endpoints objects:
//! - Registers every connect-injected pod behind an Endpoints object, plus
//!   its sidecar proxy, with the Consul agent on the pod's node
//! - Deregisters instances whose pod address is no longer listed, or all
//!   instances of a service once its Endpoints object is deleted

mod agents;
mod backoff;
mod config;
mod controller;
mod error;
mod lookup;
mod queue;
mod reconciler;
mod watcher;

use anyhow::Result;
use config::ControllerConfig;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Endpoints Controller");

    let config = ControllerConfig::from_env()?;
    config.log();

    let controller = Controller::new(config).await?;
    controller.run().await?;

    info!("Endpoints Controller stopped");
    Ok(())
}
