//! Metrics settings for the sidecar's merged Prometheus endpoint.
//!
//! Global defaults come from the injector configuration; each pod can
//! override them through annotations.

use crate::annotations::{
    non_empty_annotation, parse_bool, port_value, ANNOTATION_ENABLE_METRICS,
    ANNOTATION_ENABLE_METRICS_MERGING, ANNOTATION_MERGED_METRICS_PORT, ANNOTATION_PORT,
    ANNOTATION_PROMETHEUS_SCRAPE_PATH, ANNOTATION_PROMETHEUS_SCRAPE_PORT,
    ANNOTATION_SERVICE_METRICS_PORT,
};
use crate::error::InjectError;
use k8s_openapi::api::core::v1::Pod;

pub const DEFAULT_MERGED_METRICS_PORT: &str = "20100";
pub const DEFAULT_PROMETHEUS_SCRAPE_PORT: &str = "20200";
pub const DEFAULT_PROMETHEUS_SCRAPE_PATH: &str = "/metrics";

/// Metrics defaults applied when a pod carries no override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub default_enable_metrics: bool,
    pub default_enable_metrics_merging: bool,
    pub default_merged_metrics_port: String,
    pub default_prometheus_scrape_port: String,
    pub default_prometheus_scrape_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            default_enable_metrics: false,
            default_enable_metrics_merging: false,
            default_merged_metrics_port: DEFAULT_MERGED_METRICS_PORT.to_string(),
            default_prometheus_scrape_port: DEFAULT_PROMETHEUS_SCRAPE_PORT.to_string(),
            default_prometheus_scrape_path: DEFAULT_PROMETHEUS_SCRAPE_PATH.to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn enable_metrics(&self, pod: &Pod) -> Result<bool, InjectError> {
        match non_empty_annotation(pod, ANNOTATION_ENABLE_METRICS) {
            Some(raw) => parse_bool(ANNOTATION_ENABLE_METRICS, raw),
            None => Ok(self.default_enable_metrics),
        }
    }

    pub fn enable_metrics_merging(&self, pod: &Pod) -> Result<bool, InjectError> {
        match non_empty_annotation(pod, ANNOTATION_ENABLE_METRICS_MERGING) {
            Some(raw) => parse_bool(ANNOTATION_ENABLE_METRICS_MERGING, raw),
            None => Ok(self.default_enable_metrics_merging),
        }
    }

    /// Port Envoy serves merged metrics on, validated against the pod
    pub fn merged_metrics_port(&self, pod: &Pod) -> Result<String, InjectError> {
        metrics_port(pod, ANNOTATION_MERGED_METRICS_PORT, &self.default_merged_metrics_port)
    }

    /// Port Prometheus scrapes on the pod
    pub fn prometheus_scrape_port(&self, pod: &Pod) -> Result<String, InjectError> {
        metrics_port(pod, ANNOTATION_PROMETHEUS_SCRAPE_PORT, &self.default_prometheus_scrape_port)
    }

    pub fn prometheus_scrape_path(&self, pod: &Pod) -> String {
        non_empty_annotation(pod, ANNOTATION_PROMETHEUS_SCRAPE_PATH)
            .unwrap_or(&self.default_prometheus_scrape_path)
            .to_string()
    }

    /// Port the application exposes its own metrics on. Falls back to the
    /// service port, then `"0"` when neither is set.
    pub fn service_metrics_port(&self, pod: &Pod) -> String {
        non_empty_annotation(pod, ANNOTATION_SERVICE_METRICS_PORT)
            .or_else(|| non_empty_annotation(pod, ANNOTATION_PORT))
            .unwrap_or("0")
            .to_string()
    }

    /// The merged metrics server only runs when metrics and merging are on
    /// and there is an application metrics port to merge with.
    pub fn should_run_merged_metrics_server(&self, pod: &Pod) -> Result<bool, InjectError> {
        if !self.enable_metrics(pod)? || !self.enable_metrics_merging(pod)? {
            return Ok(false);
        }
        let service_port = self.service_metrics_port(pod);
        Ok(!service_port.is_empty() && service_port != "0")
    }
}

fn metrics_port(pod: &Pod, key: &str, default: &str) -> Result<String, InjectError> {
    let raw = non_empty_annotation(pod, key).unwrap_or(default);
    let port = port_value(pod, key, raw)?;
    if !(1..=65535).contains(&port) {
        return Err(InjectError::InvalidPort {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "is not in the valid port range 1-65535".to_string(),
        });
    }
    Ok(port.to_string())
}
