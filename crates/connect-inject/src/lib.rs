//! Consul Connect injection core
//!
//! Pure decision logic shared by the injector and the endpoints controller:
//!
//! - [`resolver`]: pod annotation > namespace label > global default
//! - [`container_init`]: init container synthesis for one (possibly multiport) service
//! - [`registration`]: service and sidecar proxy registrations for an endpoint pod
//!
//! # Example
//!
//! ```no_run
//! use connect_inject::{MeshWebhook, MultiPortInfo};
//! use k8s_openapi::api::core::v1::{Namespace, Pod};
//!
//! # fn example(namespace: &Namespace, pod: &Pod) -> Result<(), connect_inject::InjectError> {
//! let webhook = MeshWebhook {
//!     auth_method: Some("consul-k8s-auth-method".to_string()),
//!     ..Default::default()
//! };
//! let init = webhook.container_init(namespace, pod, &MultiPortInfo::default())?;
//! println!("{:?}", init.command);
//! # Ok(())
//! # }
//! ```

pub mod annotations;
pub mod container_init;
pub mod env;
pub mod error;
pub mod metrics;
pub mod registration;
pub mod resolver;
pub mod script;
pub mod upstreams;
pub mod webhook;

pub use container_init::{InitContainerPlan, MultiPortInfo};
pub use env::{EnvSource, ProcessEnv};
pub use error::InjectError;
pub use metrics::MetricsConfig;
pub use registration::{EndpointOwner, RegistrationBuilder, ServiceRegistrations};
pub use resolver::{resolve_bool, EffectiveConfig};
pub use script::InitStep;
pub use webhook::MeshWebhook;
