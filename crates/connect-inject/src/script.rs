//! Init container bootstrap steps and their shell rendering
//!
//! The synthesizer decides *which* steps run and with which values; this
//! module only turns an ordered list of [`InitStep`]s into the script the
//! init container executes. Flag names, quoting and ordering are a
//! compatibility contract with `consul-k8s-control-plane connect-init` and
//! `consul connect envoy|redirect-traffic`.

use std::fmt::Write as _;
use std::time::Duration;

/// Shared volume mount path inside every injected container
pub const CONNECT_INJECT_DIR: &str = "/consul/connect-inject";
const CONSUL_BINARY: &str = "/consul/connect-inject/consul";

/// One bootstrap operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStep {
    /// Point the Consul CLI at the node-local agent
    ExportConsulAddresses {
        /// PEM CA certificate; switches to https and writes the CA file
        ca_cert: Option<String>,
    },
    /// Poll for the service and proxy registrations, log in when ACLs are on
    ConnectInit(ConnectInitStep),
    /// Generate the Envoy bootstrap config for the registered proxy
    EnvoyBootstrap(EnvoyBootstrapStep),
    /// Install iptables rules sending pod traffic through Envoy
    RedirectTraffic(RedirectTrafficStep),
}

/// ACL login performed by connect-init
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclLogin {
    pub auth_method: String,
    pub service_account_name: String,
    pub service_name: String,
    pub bearer_token_file: String,
    /// Per-service token file, multiport only
    pub token_sink: Option<String>,
    /// Namespace the auth method lives in
    pub auth_method_namespace: Option<String>,
}

/// Per-service addressing of one multiport service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiportTarget {
    pub service_name: String,
    pub proxy_id_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInitStep {
    pub api_timeout: Duration,
    pub acl: Option<AclLogin>,
    pub multiport: Option<MultiportTarget>,
    pub partition: Option<String>,
    pub namespace: Option<String>,
}

/// Envoy metrics listener wiring; empty fields are omitted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrometheusFlags {
    pub scrape_path: Option<String>,
    pub backend_port: Option<String>,
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvoyBootstrapStep {
    pub proxy_id_file: String,
    pub prometheus: PrometheusFlags,
    pub token_file: Option<String>,
    pub partition: Option<String>,
    pub namespace: Option<String>,
    /// Envoy admin port, set for multiport pods so proxies do not collide
    pub admin_bind_port: Option<u32>,
    pub output_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectTrafficStep {
    pub token_file: Option<String>,
    pub partition: Option<String>,
    pub namespace: Option<String>,
    pub consul_dns_ip: Option<String>,
    pub exclude_inbound_ports: Vec<String>,
    pub exclude_outbound_ports: Vec<String>,
    pub exclude_outbound_cidrs: Vec<String>,
    pub exclude_uids: Vec<String>,
    pub proxy_id_file: String,
    pub proxy_uid: i64,
}

/// Render steps, in order, into the init container script
pub fn render(steps: &[InitStep]) -> String {
    let mut script = String::new();
    for step in steps {
        match step {
            InitStep::ExportConsulAddresses { ca_cert } => render_exports(&mut script, ca_cert.as_deref()),
            InitStep::ConnectInit(step) => render_connect_init(&mut script, step),
            InitStep::EnvoyBootstrap(step) => render_envoy_bootstrap(&mut script, step),
            InitStep::RedirectTraffic(step) => render_redirect_traffic(&mut script, step),
        }
    }
    script
}

fn render_exports(script: &mut String, ca_cert: Option<&str>) {
    match ca_cert {
        Some(pem) => {
            let ca_file = format!("{CONNECT_INJECT_DIR}/consul-ca.pem");
            script.push_str("\nexport CONSUL_HTTP_ADDR=\"https://${HOST_IP}:8501\"");
            script.push_str("\nexport CONSUL_GRPC_ADDR=\"https://${HOST_IP}:8502\"");
            let _ = write!(script, "\nexport CONSUL_CACERT={ca_file}");
            let _ = write!(script, "\ncat <<EOF >{ca_file}\n{pem}\nEOF");
        }
        None => {
            script.push_str("\nexport CONSUL_HTTP_ADDR=\"${HOST_IP}:8500\"");
            script.push_str("\nexport CONSUL_GRPC_ADDR=\"${HOST_IP}:8502\"");
        }
    }
}

/// Continuation line: `\n  <flag> \`
fn flag(script: &mut String, text: impl AsRef<str>) {
    let _ = write!(script, "\n  {} \\", text.as_ref());
}

fn quoted(script: &mut String, name: &str, value: &str) {
    flag(script, format!("-{name}=\"{value}\""));
}

fn quoted_opt(script: &mut String, name: &str, value: Option<&String>) {
    if let Some(value) = value {
        quoted(script, name, value);
    }
}

fn render_connect_init(script: &mut String, step: &ConnectInitStep) {
    script.push_str(
        "\nconsul-k8s-control-plane connect-init -pod-name=${POD_NAME} -pod-namespace=${POD_NAMESPACE} \\",
    );
    flag(script, format!("-consul-api-timeout={}", go_duration(step.api_timeout)));

    if let Some(acl) = &step.acl {
        quoted(script, "acl-auth-method", &acl.auth_method);
        quoted(script, "service-account-name", &acl.service_account_name);
        quoted(script, "service-name", &acl.service_name);
        flag(script, format!("-bearer-token-file={}", acl.bearer_token_file));
        if let Some(sink) = &acl.token_sink {
            flag(script, format!("-acl-token-sink={sink}"));
        }
        quoted_opt(script, "auth-method-namespace", acl.auth_method_namespace.as_ref());
    }
    if let Some(target) = &step.multiport {
        flag(script, "-multiport=true");
        flag(script, format!("-proxy-id-file={}", target.proxy_id_file));
        // The login flags already carry the service name
        if step.acl.is_none() {
            quoted(script, "service-name", &target.service_name);
        }
    }
    quoted_opt(script, "partition", step.partition.as_ref());
    quoted_opt(script, "consul-service-namespace", step.namespace.as_ref());
}

fn render_envoy_bootstrap(script: &mut String, step: &EnvoyBootstrapStep) {
    let _ = write!(
        script,
        "\n\n# Generate the envoy bootstrap code\n{CONSUL_BINARY} connect envoy \\"
    );
    quoted(script, "proxy-id", &format!("$(cat {})", step.proxy_id_file));

    let prometheus = &step.prometheus;
    quoted_opt(script, "prometheus-scrape-path", prometheus.scrape_path.as_ref());
    quoted_opt(script, "prometheus-backend-port", prometheus.backend_port.as_ref());
    quoted_opt(script, "prometheus-ca-file", prometheus.ca_file.as_ref());
    quoted_opt(script, "prometheus-ca-path", prometheus.ca_path.as_ref());
    quoted_opt(script, "prometheus-cert-file", prometheus.cert_file.as_ref());
    quoted_opt(script, "prometheus-key-file", prometheus.key_file.as_ref());

    quoted_opt(script, "token-file", step.token_file.as_ref());
    quoted_opt(script, "partition", step.partition.as_ref());
    quoted_opt(script, "namespace", step.namespace.as_ref());
    if let Some(port) = step.admin_bind_port {
        flag(script, format!("-admin-bind=127.0.0.1:{port}"));
    }
    let _ = write!(script, "\n  -bootstrap > {}", step.output_path);
}

fn render_redirect_traffic(script: &mut String, step: &RedirectTrafficStep) {
    let _ = write!(
        script,
        "\n\n# Apply traffic redirection rules.\n{CONSUL_BINARY} connect redirect-traffic \\"
    );
    quoted_opt(script, "token-file", step.token_file.as_ref());
    quoted_opt(script, "partition", step.partition.as_ref());
    quoted_opt(script, "namespace", step.namespace.as_ref());
    quoted_opt(script, "consul-dns-ip", step.consul_dns_ip.as_ref());
    for port in &step.exclude_inbound_ports {
        quoted(script, "exclude-inbound-port", port);
    }
    for port in &step.exclude_outbound_ports {
        quoted(script, "exclude-outbound-port", port);
    }
    for cidr in &step.exclude_outbound_cidrs {
        quoted(script, "exclude-outbound-cidr", cidr);
    }
    for uid in &step.exclude_uids {
        quoted(script, "exclude-uid", uid);
    }
    quoted(script, "proxy-id", &format!("$(cat {})", step.proxy_id_file));
    let _ = write!(script, "\n  -proxy-uid={}", step.proxy_uid);
}

/// Format a duration the way the bootstrap binary parses it: `0s`, `500ms`,
/// `5s`, `1m30s`, `1h0m0s`.
pub fn go_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos, 1_000_000));
    }

    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = fraction(u128::from(total_secs % 60) * 1_000_000_000 + u128::from(duration.subsec_nanos()), 1_000_000_000);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `value / unit` with trailing fractional zeros trimmed
fn fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rest = value % unit;
    if rest == 0 {
        return whole.to_string();
    }
    let width = unit.to_string().len() - 1;
    let digits = format!("{rest:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
