//! Controller configuration.
//!
//! Loaded once at startup from environment variables and shared read-only
//! by every reconciliation pass.

use crate::error::ControllerError;
use connect_inject::{EnvSource, ProcessEnv};
use std::collections::BTreeSet;
use tracing::info;

/// Wildcard entry of the namespace allow list
pub const WILDCARD_NAMESPACE: &str = "*";

/// Namespaces whose services are never registered
const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "local-path-storage"];

/// Process-wide controller settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Agent used for config entry reads (mesh gateway checks)
    pub consul_http_addr: String,
    /// Scheme of the per-node agents, `http` or `https`
    pub consul_scheme: String,
    /// Port of the per-node agents
    pub consul_port: u16,
    pub consul_ca_cert: Option<String>,
    pub consul_token: Option<String>,
    pub allow_k8s_namespaces: BTreeSet<String>,
    pub deny_k8s_namespaces: BTreeSet<String>,
    /// Helm release of the Consul client daemonset
    pub release_name: String,
    pub release_namespace: String,
    /// Only watch this namespace; all namespaces when `None`
    pub watch_namespace: Option<String>,
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_source(&ProcessEnv)
    }

    /// Load configuration from any environment source
    pub fn from_source(env: &dyn EnvSource) -> Result<Self, ControllerError> {
        let consul_scheme = env
            .var("CONSUL_SCHEME")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "http".to_string());
        if consul_scheme != "http" && consul_scheme != "https" {
            return Err(ControllerError::InvalidConfig(format!(
                "CONSUL_SCHEME must be http or https, got {:?}",
                consul_scheme
            )));
        }

        let consul_port = match env.var("CONSUL_PORT").filter(|p| !p.is_empty()) {
            Some(raw) => raw.parse::<u16>().ok().filter(|p| *p > 0).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("CONSUL_PORT is not a valid port: {:?}", raw))
            })?,
            None => 8500,
        };

        let allow_k8s_namespaces = match env.var("ALLOW_K8S_NAMESPACES") {
            Some(raw) => namespace_set(&raw),
            None => BTreeSet::from([WILDCARD_NAMESPACE.to_string()]),
        };

        Ok(Self {
            consul_http_addr: env
                .var("CONSUL_HTTP_ADDR")
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "http://127.0.0.1:8500".to_string()),
            consul_scheme,
            consul_port,
            consul_ca_cert: env.var("CONSUL_CACERT_PEM").filter(|c| !c.is_empty()),
            consul_token: env.var("CONSUL_HTTP_TOKEN").filter(|t| !t.is_empty()),
            allow_k8s_namespaces,
            deny_k8s_namespaces: env.var("DENY_K8S_NAMESPACES").map(|raw| namespace_set(&raw)).unwrap_or_default(),
            release_name: env
                .var("RELEASE_NAME")
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "consul".to_string()),
            release_namespace: env
                .var("RELEASE_NAMESPACE")
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "default".to_string()),
            watch_namespace: env.var("WATCH_NAMESPACE").filter(|n| !n.is_empty()),
        })
    }

    /// Whether services in `namespace` are left alone.
    ///
    /// System namespaces and denied namespaces are always ignored; anything
    /// else must be allowed explicitly unless the allow list holds `*`.
    pub fn should_ignore(&self, namespace: &str) -> bool {
        if SYSTEM_NAMESPACES.contains(&namespace) {
            return true;
        }
        if self.deny_k8s_namespaces.contains(namespace) {
            return true;
        }
        !self.allow_k8s_namespaces.contains(WILDCARD_NAMESPACE) && !self.allow_k8s_namespaces.contains(namespace)
    }

    /// Log the effective configuration (the token and CA are never printed)
    pub fn log(&self) {
        info!("Configuration:");
        info!("  Consul HTTP address: {}", self.consul_http_addr);
        info!("  Agent scheme/port: {}/{}", self.consul_scheme, self.consul_port);
        info!("  Agent CA certificate: {}", if self.consul_ca_cert.is_some() { "set" } else { "none" });
        info!("  Allowed namespaces: {:?}", self.allow_k8s_namespaces);
        info!("  Denied namespaces: {:?}", self.deny_k8s_namespaces);
        info!("  Release: {}/{}", self.release_namespace, self.release_name);
        info!("  Namespace: {}", self.watch_namespace.as_deref().unwrap_or("all namespaces"));
    }
}

fn namespace_set(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_source(&env(&[])).unwrap();
        assert_eq!(config.consul_http_addr, "http://127.0.0.1:8500");
        assert_eq!(config.consul_scheme, "http");
        assert_eq!(config.consul_port, 8500);
        assert_eq!(config.consul_ca_cert, None);
        assert_eq!(config.allow_k8s_namespaces, BTreeSet::from(["*".to_string()]));
        assert!(config.deny_k8s_namespaces.is_empty());
        assert_eq!(config.release_name, "consul");
        assert_eq!(config.release_namespace, "default");
        assert_eq!(config.watch_namespace, None);
    }

    #[test]
    fn test_overrides() {
        let config = ControllerConfig::from_source(&env(&[
            ("CONSUL_SCHEME", "https"),
            ("CONSUL_PORT", "8501"),
            ("ALLOW_K8S_NAMESPACES", "team-a, team-b,"),
            ("DENY_K8S_NAMESPACES", "team-b"),
            ("RELEASE_NAME", "mesh"),
            ("RELEASE_NAMESPACE", "consul"),
            ("WATCH_NAMESPACE", "team-a"),
        ]))
        .unwrap();
        assert_eq!(config.consul_scheme, "https");
        assert_eq!(config.consul_port, 8501);
        assert_eq!(
            config.allow_k8s_namespaces,
            BTreeSet::from(["team-a".to_string(), "team-b".to_string()])
        );
        assert_eq!(config.deny_k8s_namespaces, BTreeSet::from(["team-b".to_string()]));
        assert_eq!(config.release_name, "mesh");
        assert_eq!(config.release_namespace, "consul");
        assert_eq!(config.watch_namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_invalid_values() {
        for vars in [
            [("CONSUL_PORT", "eighty")],
            [("CONSUL_PORT", "0")],
            [("CONSUL_PORT", "70000")],
            [("CONSUL_SCHEME", "grpc")],
        ] {
            let err = ControllerConfig::from_source(&env(&vars)).unwrap_err();
            assert!(matches!(err, ControllerError::InvalidConfig(_)), "{:?}", vars);
        }
    }

    #[test]
    fn test_should_ignore() {
        let cases = [
            // (allow, deny, namespace, ignored)
            ("*", "", "default", false),
            ("*", "", "kube-system", true),
            ("*", "", "kube-public", true),
            ("*", "", "local-path-storage", true),
            ("*", "default", "default", true),
            ("default", "", "default", false),
            ("default", "", "other", true),
            ("default,other", "other", "other", true),
            ("", "", "default", true),
        ];
        for (allow, deny, namespace, ignored) in cases {
            let config = ControllerConfig::from_source(&env(&[
                ("ALLOW_K8S_NAMESPACES", allow),
                ("DENY_K8S_NAMESPACES", deny),
            ]))
            .unwrap();
            assert_eq!(
                config.should_ignore(namespace),
                ignored,
                "allow={allow:?} deny={deny:?} namespace={namespace:?}"
            );
        }
    }
}
