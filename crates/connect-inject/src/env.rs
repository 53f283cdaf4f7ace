//! Environment lookup used to find the Consul DNS service address.
//!
//! Kubernetes injects `<SERVICE>_SERVICE_HOST` variables into the webhook's
//! own environment; the synthesizer reads them through [`EnvSource`] so the
//! lookup can be replaced with a fixed map in tests.

use std::collections::HashMap;
use std::fmt::Debug;

/// Source of environment-style key/value lookups
pub trait EnvSource: Send + Sync + Debug {
    /// Value for `key`, `None` when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}
