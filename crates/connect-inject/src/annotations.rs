//! Annotation and label keys read from pods and namespaces, plus the
//! small helpers that read them.
//!
//! Annotations are the untyped input boundary: every value is a string
//! parsed on demand by the resolver, metrics config, or registration
//! builder.

use crate::error::InjectError;
use k8s_openapi::api::core::v1::Pod;

/// Injection status marker, set by the webhook once a pod has been mutated
pub const ANNOTATION_STATUS: &str = "consul.hashicorp.com/connect-inject-status";
/// Value of [`ANNOTATION_STATUS`] on injected pods
pub const INJECTED: &str = "injected";

/// Consul service name override (comma separated for multiport pods)
pub const ANNOTATION_SERVICE: &str = "consul.hashicorp.com/connect-service";
/// Named or numeric container port to register for the service
pub const ANNOTATION_PORT: &str = "consul.hashicorp.com/connect-service-port";
/// Upstream list, `svc:port[:dc]` or `prepared_query:name:port`, comma separated
pub const ANNOTATION_UPSTREAMS: &str = "consul.hashicorp.com/connect-service-upstreams";
pub const ANNOTATION_TAGS: &str = "consul.hashicorp.com/service-tags";
/// Deprecated alias of [`ANNOTATION_TAGS`]
pub const ANNOTATION_CONNECT_TAGS: &str = "consul.hashicorp.com/connect-service-tags";
/// Prefix of annotations copied into registration metadata
pub const ANNOTATION_META_PREFIX: &str = "consul.hashicorp.com/service-meta-";

pub const ANNOTATION_ENABLE_METRICS: &str = "consul.hashicorp.com/enable-metrics";
pub const ANNOTATION_ENABLE_METRICS_MERGING: &str = "consul.hashicorp.com/enable-metrics-merging";
pub const ANNOTATION_MERGED_METRICS_PORT: &str = "consul.hashicorp.com/merged-metrics-port";
pub const ANNOTATION_PROMETHEUS_SCRAPE_PORT: &str = "consul.hashicorp.com/prometheus-scrape-port";
pub const ANNOTATION_PROMETHEUS_SCRAPE_PATH: &str = "consul.hashicorp.com/prometheus-scrape-path";
pub const ANNOTATION_SERVICE_METRICS_PORT: &str = "consul.hashicorp.com/service-metrics-port";
pub const ANNOTATION_PROMETHEUS_CA_FILE: &str = "consul.hashicorp.com/prometheus-ca-file";
pub const ANNOTATION_PROMETHEUS_CA_PATH: &str = "consul.hashicorp.com/prometheus-ca-path";
pub const ANNOTATION_PROMETHEUS_CERT_FILE: &str = "consul.hashicorp.com/prometheus-cert-file";
pub const ANNOTATION_PROMETHEUS_KEY_FILE: &str = "consul.hashicorp.com/prometheus-key-file";

/// Transparent proxy toggle; read from pod annotations and namespace labels
pub const KEY_TRANSPARENT_PROXY: &str = "consul.hashicorp.com/transparent-proxy";
/// Consul DNS toggle; read from pod annotations and namespace labels
pub const KEY_CONSUL_DNS: &str = "consul.hashicorp.com/consul-dns";
pub const ANNOTATION_TPROXY_EXCLUDE_INBOUND_PORTS: &str =
    "consul.hashicorp.com/transparent-proxy-exclude-inbound-ports";
pub const ANNOTATION_TPROXY_EXCLUDE_OUTBOUND_PORTS: &str =
    "consul.hashicorp.com/transparent-proxy-exclude-outbound-ports";
pub const ANNOTATION_TPROXY_EXCLUDE_OUTBOUND_CIDRS: &str =
    "consul.hashicorp.com/transparent-proxy-exclude-outbound-cidrs";
pub const ANNOTATION_TPROXY_EXCLUDE_UIDS: &str = "consul.hashicorp.com/transparent-proxy-exclude-uids";

/// Registration metadata key holding the owning pod name
pub const META_KEY_POD_NAME: &str = "pod-name";
/// Registration metadata key holding the Kubernetes service name
pub const META_KEY_KUBE_SERVICE_NAME: &str = "k8s-service-name";
/// Registration metadata key holding the Kubernetes namespace
pub const META_KEY_KUBE_NS: &str = "k8s-namespace";

/// Raw annotation value, if present (possibly empty)
pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Annotation value when present and non-empty
pub fn non_empty_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    annotation(pod, key).filter(|raw| !raw.is_empty())
}

/// True when the webhook has marked the pod as injected
pub fn has_been_injected(pod: &Pod) -> bool {
    annotation(pod, ANNOTATION_STATUS) == Some(INJECTED)
}

/// Split a comma separated annotation into its items, keeping order and
/// empty items. Absent annotation yields an empty list.
pub fn split_comma_separated(pod: &Pod, key: &str) -> Vec<String> {
    annotation(pod, key)
        .map(|raw| raw.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

/// Parse a boolean the way the webhook always has: `1 t T TRUE true True`
/// and `0 f F FALSE false False`.
pub fn parse_bool(key: &str, raw: &str) -> Result<bool, InjectError> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(InjectError::InvalidBool {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Resolve a port annotation value against the pod.
///
/// Only the part before the first comma is used. A container port with a
/// matching name wins; otherwise the value is parsed as an integer
/// (decimal, or `0x`/`0o`/`0b`/leading-zero octal).
pub fn port_value(pod: &Pod, key: &str, raw: &str) -> Result<i32, InjectError> {
    let value = raw.split(',').next().unwrap_or_default();

    let named = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.ports.iter().flatten())
        .find(|port| port.name.as_deref() == Some(value));
    if let Some(port) = named {
        return Ok(port.container_port);
    }

    parse_int(value).ok_or_else(|| InjectError::InvalidPort {
        key: key.to_string(),
        value: raw.to_string(),
        reason: "is not a valid integer".to_string(),
    })
}

fn parse_int(value: &str) -> Option<i32> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (radix, digits) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, hex)
    } else if let Some(oct) = digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")) {
        (8, oct)
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        (2, bin)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if digits.is_empty() {
        return None;
    }
    let parsed = i64::from_str_radix(digits, radix).ok()?;
    let parsed = if negative { -parsed } else { parsed };
    i32::try_from(parsed).ok()
}
