//! Three-tier configuration resolution
//!
//! Pod annotation wins over namespace label, which wins over the global
//! default. A value that is present but not a boolean is an error for the
//! pod being processed; it never falls back to the next tier.

use crate::annotations::{annotation, parse_bool, KEY_CONSUL_DNS, KEY_TRANSPARENT_PROXY};
use crate::error::InjectError;
use k8s_openapi::api::core::v1::{Namespace, Pod};

/// Resolve a boolean setting by precedence: pod annotation, namespace label,
/// global default.
pub fn resolve_bool(
    pod: &Pod,
    namespace: &Namespace,
    key: &str,
    global_default: bool,
) -> Result<bool, InjectError> {
    if let Some(raw) = annotation(pod, key) {
        return parse_bool(key, raw);
    }
    let label = namespace
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key));
    if let Some(raw) = label {
        return parse_bool(key, raw);
    }
    Ok(global_default)
}

/// Per-pod settings derived from annotations, labels and global defaults.
/// Recomputed on every synthesis; never stored. Metrics merging is resolved
/// later, once the ACL login has been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub transparent_proxy: bool,
    pub consul_dns: bool,
}

impl EffectiveConfig {
    pub fn resolve(
        pod: &Pod,
        namespace: &Namespace,
        global_transparent_proxy: bool,
        global_consul_dns: bool,
    ) -> Result<Self, InjectError> {
        Ok(Self {
            transparent_proxy: resolve_bool(pod, namespace, KEY_TRANSPARENT_PROXY, global_transparent_proxy)?,
            consul_dns: resolve_bool(pod, namespace, KEY_CONSUL_DNS, global_consul_dns)?,
        })
    }
}
