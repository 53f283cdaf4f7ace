//! Consul Agent API Client
//!
//! A small client for the parts of the Consul HTTP API the connect-inject
//! controllers need: local service registration on a node agent, metadata
//! filtered service listing, and the global `proxy-defaults` config entry.
//!
//! # Example
//!
//! ```no_run
//! use consul_client::{ConsulClient, ConsulClientConfig, ConsulClientTrait, ServiceFilter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConsulClient::new(ConsulClientConfig::new("http://10.0.0.12:8500"))?;
//!
//! let filter = ServiceFilter::new()
//!     .meta_eq("k8s-service-name", "web")
//!     .meta_eq("k8s-namespace", "default");
//! for (id, _service) in client.services_with_filter(&filter).await? {
//!     client.service_deregister(&id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod consul_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{ConsulClient, ConsulClientConfig};
pub use consul_trait::ConsulClientTrait;
pub use error::ConsulError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{MockCall, MockConsulClient};
