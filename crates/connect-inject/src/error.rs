//! Errors raised while resolving pod configuration, synthesizing the init
//! container, or building registrations.

use thiserror::Error;

/// Errors that abort processing of a single pod
#[derive(Debug, Error)]
pub enum InjectError {
    /// An annotation or label held a value that is not a boolean
    #[error("{key} value {value:?} is not a valid boolean")]
    InvalidBool {
        /// Annotation or label key
        key: String,
        /// Raw value found on the object
        value: String,
    },

    /// A port annotation could not be resolved to a usable port
    #[error("{key} annotation value of {value} {reason}")]
    InvalidPort {
        /// Annotation key
        key: String,
        /// Raw annotation value
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Consul DNS is enabled but the DNS service address is not in the environment
    #[error("environment variable {0} is not found")]
    MissingDnsServiceHost(String),

    /// An auth method is configured but no service account token is mounted
    #[error("unable to find service account token volume mount")]
    ServiceAccountMountNotFound,

    /// Incomplete Prometheus TLS configuration
    #[error("{0}")]
    PrometheusTls(String),

    /// Malformed or unusable upstream annotation entry
    #[error("upstream {upstream:?} is invalid: {reason}")]
    InvalidUpstream {
        /// The raw upstream entry
        upstream: String,
        /// Why it was rejected
        reason: String,
    },
}
