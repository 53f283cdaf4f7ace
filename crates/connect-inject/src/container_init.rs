//! Init container synthesis
//!
//! [`MeshWebhook::init_container_plan`] resolves everything a pod needs
//! before its sidecar can start into an [`InitContainerPlan`]: the ordered
//! bootstrap steps, volume mounts and security context. The plan is then
//! turned into a `Container` spec. Every configuration problem is returned
//! as an [`InjectError`] so injection fails closed.

use crate::annotations::{
    annotation, non_empty_annotation, split_comma_separated, ANNOTATION_PROMETHEUS_CA_FILE,
    ANNOTATION_PROMETHEUS_CA_PATH, ANNOTATION_PROMETHEUS_CERT_FILE, ANNOTATION_PROMETHEUS_KEY_FILE,
    ANNOTATION_SERVICE, ANNOTATION_TPROXY_EXCLUDE_INBOUND_PORTS,
    ANNOTATION_TPROXY_EXCLUDE_OUTBOUND_CIDRS, ANNOTATION_TPROXY_EXCLUDE_OUTBOUND_PORTS,
    ANNOTATION_TPROXY_EXCLUDE_UIDS,
};
use crate::error::InjectError;
use crate::resolver::EffectiveConfig;
use crate::script::{
    render, AclLogin, ConnectInitStep, EnvoyBootstrapStep, InitStep, MultiportTarget,
    PrometheusFlags, RedirectTrafficStep, CONNECT_INJECT_DIR,
};
use crate::webhook::MeshWebhook;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector, Pod,
    SecurityContext, VolumeMount,
};
use tracing::debug;

pub const INJECT_INIT_COPY_CONTAINER_NAME: &str = "copy-consul-bin";
pub const INJECT_INIT_CONTAINER_NAME: &str = "consul-connect-inject-init";
/// Volume shared between the init containers, Envoy and the copy container
pub const VOLUME_NAME: &str = "consul-connect-inject-data";

pub const ROOT_USER_AND_GROUP_ID: i64 = 0;
pub const ENVOY_USER_AND_GROUP_ID: i64 = 5995;
pub const INIT_CONTAINERS_USER_AND_GROUP_ID: i64 = 5996;
const NET_ADMIN_CAPABILITY: &str = "NET_ADMIN";
const ENVOY_ADMIN_BASE_PORT: u32 = 19000;

const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Identifies one service of a multiport pod. The default value means a
/// single-service pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiPortInfo {
    pub service_index: u32,
    pub service_name: String,
}

/// Everything needed to build the init container for one service
#[derive(Debug, Clone, PartialEq)]
pub struct InitContainerPlan {
    pub container_name: String,
    pub steps: Vec<InitStep>,
    pub volume_mounts: Vec<VolumeMount>,
    pub security_context: Option<SecurityContext>,
}

impl InitContainerPlan {
    /// The `/bin/sh -ec` script for the plan's steps
    pub fn script(&self) -> String {
        render(&self.steps)
    }
}

impl MeshWebhook {
    /// Resolve the bootstrap plan for one service of `pod`
    pub fn init_container_plan(
        &self,
        namespace: &Namespace,
        pod: &Pod,
        mpi: &MultiPortInfo,
    ) -> Result<InitContainerPlan, InjectError> {
        let effective = EffectiveConfig::resolve(
            pod,
            namespace,
            self.enable_transparent_proxy,
            self.enable_consul_dns,
        )?;

        let consul_dns_ip = if effective.consul_dns {
            let key = self.dns_service_host_name();
            match self.env.var(&key).filter(|ip| !ip.is_empty()) {
                Some(ip) => Some(ip),
                None => return Err(InjectError::MissingDnsServiceHost(key)),
            }
        } else {
            None
        };

        let multiport = !mpi.service_name.is_empty();
        let service_name = if multiport {
            mpi.service_name.clone()
        } else {
            annotation(pod, ANNOTATION_SERVICE).unwrap_or_default().to_string()
        };
        let k8s_namespace = namespace.metadata.name.as_deref().unwrap_or_default();
        let consul_namespace = Some(self.consul_namespace(k8s_namespace)).filter(|ns| !ns.is_empty());
        let partition = self.partition();

        let mut volume_mounts = vec![VolumeMount {
            name: VOLUME_NAME.to_string(),
            mount_path: CONNECT_INJECT_DIR.to_string(),
            ..Default::default()
        }];

        let acl = match self.auth_method() {
            Some(auth_method) => {
                let service_account_name = if multiport {
                    mpi.service_name.clone()
                } else {
                    pod.spec
                        .as_ref()
                        .and_then(|spec| spec.service_account_name.clone())
                        .unwrap_or_default()
                };
                let (mount, bearer_token_file) =
                    find_service_account_volume_mount(pod, multiport.then_some(mpi.service_name.as_str()))?;
                volume_mounts.push(mount);

                let auth_method_namespace = consul_namespace.as_ref().map(|ns| {
                    // Mirrored services still log in against the auth method in "default"
                    if self.enable_k8s_ns_mirroring {
                        "default".to_string()
                    } else {
                        ns.clone()
                    }
                });
                Some(AclLogin {
                    auth_method: auth_method.to_string(),
                    service_account_name,
                    service_name: service_name.clone(),
                    bearer_token_file,
                    token_sink: multiport.then(|| format!("{CONNECT_INJECT_DIR}/acl-token-{service_name}")),
                    auth_method_namespace,
                })
            }
            None => None,
        };

        let prometheus = self.prometheus_flags(pod)?;

        let per_service = |stem: &str| {
            if multiport {
                format!("{CONNECT_INJECT_DIR}/{stem}-{service_name}")
            } else {
                format!("{CONNECT_INJECT_DIR}/{stem}")
            }
        };
        let proxy_id_file = per_service("proxyid");

        let mut steps = vec![
            InitStep::ExportConsulAddresses {
                ca_cert: self.ca_cert(),
            },
            InitStep::ConnectInit(ConnectInitStep {
                api_timeout: self.consul_api_timeout,
                acl: acl.clone(),
                multiport: multiport.then(|| MultiportTarget {
                    service_name: service_name.clone(),
                    proxy_id_file: proxy_id_file.clone(),
                }),
                partition: partition.clone(),
                namespace: consul_namespace.clone(),
            }),
            InitStep::EnvoyBootstrap(EnvoyBootstrapStep {
                proxy_id_file,
                prometheus,
                token_file: acl.as_ref().map(|_| per_service("acl-token")),
                partition: partition.clone(),
                namespace: consul_namespace.clone(),
                admin_bind_port: multiport.then_some(ENVOY_ADMIN_BASE_PORT + mpi.service_index),
                output_path: format!("{}.yaml", per_service("envoy-bootstrap")),
            }),
        ];

        if effective.transparent_proxy && !self.enable_cni {
            steps.push(InitStep::RedirectTraffic(RedirectTrafficStep {
                token_file: acl.as_ref().map(|_| format!("{CONNECT_INJECT_DIR}/acl-token")),
                partition,
                namespace: consul_namespace,
                consul_dns_ip,
                exclude_inbound_ports: split_comma_separated(pod, ANNOTATION_TPROXY_EXCLUDE_INBOUND_PORTS),
                exclude_outbound_ports: split_comma_separated(pod, ANNOTATION_TPROXY_EXCLUDE_OUTBOUND_PORTS),
                exclude_outbound_cidrs: split_comma_separated(pod, ANNOTATION_TPROXY_EXCLUDE_OUTBOUND_CIDRS),
                exclude_uids: split_comma_separated(pod, ANNOTATION_TPROXY_EXCLUDE_UIDS),
                proxy_id_file: format!("{CONNECT_INJECT_DIR}/proxyid"),
                proxy_uid: ENVOY_USER_AND_GROUP_ID,
            }));
        }

        let container_name = if multiport {
            format!("{INJECT_INIT_CONTAINER_NAME}-{service_name}")
        } else {
            INJECT_INIT_CONTAINER_NAME.to_string()
        };
        debug!(
            "Planned init container {} with {} steps (tproxy: {}, cni: {})",
            container_name,
            steps.len(),
            effective.transparent_proxy,
            self.enable_cni
        );

        Ok(InitContainerPlan {
            container_name,
            steps,
            volume_mounts,
            security_context: init_security_context(effective.transparent_proxy, self.enable_cni),
        })
    }

    /// Init container that waits for registration and bootstraps Envoy
    pub fn container_init(
        &self,
        namespace: &Namespace,
        pod: &Pod,
        mpi: &MultiPortInfo,
    ) -> Result<Container, InjectError> {
        let plan = self.init_container_plan(namespace, pod, mpi)?;
        let script = plan.script();
        Ok(Container {
            name: plan.container_name,
            image: Some(self.image_consul_k8s.clone()),
            env: Some(vec![
                field_ref_env("HOST_IP", "status.hostIP"),
                field_ref_env("POD_IP", "status.podIP"),
                field_ref_env("POD_NAME", "metadata.name"),
                field_ref_env("POD_NAMESPACE", "metadata.namespace"),
            ]),
            resources: Some(self.init_container_resources.clone()),
            volume_mounts: Some(plan.volume_mounts),
            command: Some(vec!["/bin/sh".to_string(), "-ec".to_string(), script]),
            security_context: plan.security_context,
            ..Default::default()
        })
    }

    /// Copies the `consul` binary into the shared volume
    pub fn init_copy_container(&self) -> Container {
        // OpenShift assigns a random uid/gid itself
        let security_context = (!self.enable_openshift).then(|| SecurityContext {
            run_as_user: Some(INIT_CONTAINERS_USER_AND_GROUP_ID),
            run_as_group: Some(INIT_CONTAINERS_USER_AND_GROUP_ID),
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        });
        Container {
            name: INJECT_INIT_COPY_CONTAINER_NAME.to_string(),
            image: Some(self.image_consul.clone()),
            resources: Some(self.init_container_resources.clone()),
            volume_mounts: Some(vec![VolumeMount {
                name: VOLUME_NAME.to_string(),
                mount_path: CONNECT_INJECT_DIR.to_string(),
                ..Default::default()
            }]),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-ec".to_string(),
                format!("cp /bin/consul {CONNECT_INJECT_DIR}/consul"),
            ]),
            security_context,
            ..Default::default()
        }
    }

    fn prometheus_flags(&self, pod: &Pod) -> Result<PrometheusFlags, InjectError> {
        let mut flags = PrometheusFlags::default();
        if self.metrics_config.should_run_merged_metrics_server(pod)? {
            flags.scrape_path = Some(self.metrics_config.prometheus_scrape_path(pod));
            flags.backend_port = Some(self.metrics_config.merged_metrics_port(pod)?);
        }

        let tls = |key| non_empty_annotation(pod, key).map(str::to_string);
        flags.ca_file = tls(ANNOTATION_PROMETHEUS_CA_FILE);
        flags.ca_path = tls(ANNOTATION_PROMETHEUS_CA_PATH);
        flags.cert_file = tls(ANNOTATION_PROMETHEUS_CERT_FILE);
        flags.key_file = tls(ANNOTATION_PROMETHEUS_KEY_FILE);

        let any_tls = flags.ca_file.is_some()
            || flags.ca_path.is_some()
            || flags.cert_file.is_some()
            || flags.key_file.is_some();
        if any_tls {
            if flags.ca_file.is_none() && flags.ca_path.is_none() {
                return Err(InjectError::PrometheusTls(format!(
                    "Must set one of {ANNOTATION_PROMETHEUS_CA_FILE:?} or {ANNOTATION_PROMETHEUS_CA_PATH:?} when providing prometheus TLS config"
                )));
            }
            if flags.cert_file.is_none() {
                return Err(InjectError::PrometheusTls(format!(
                    "Must set {ANNOTATION_PROMETHEUS_CERT_FILE:?} when providing prometheus TLS config"
                )));
            }
            if flags.key_file.is_none() {
                return Err(InjectError::PrometheusTls(format!(
                    "Must set {ANNOTATION_PROMETHEUS_KEY_FILE:?} when providing prometheus TLS config"
                )));
            }
        }
        Ok(flags)
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Redirecting traffic with iptables needs root and NET_ADMIN. With CNI the
/// plugin does that, so the container drops everything.
fn init_security_context(transparent_proxy: bool, cni: bool) -> Option<SecurityContext> {
    if !transparent_proxy {
        return None;
    }
    if cni {
        return Some(SecurityContext {
            run_as_user: Some(INIT_CONTAINERS_USER_AND_GROUP_ID),
            run_as_group: Some(INIT_CONTAINERS_USER_AND_GROUP_ID),
            run_as_non_root: Some(true),
            privileged: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    Some(SecurityContext {
        run_as_user: Some(ROOT_USER_AND_GROUP_ID),
        run_as_group: Some(ROOT_USER_AND_GROUP_ID),
        // Overrides a pod-level runAsNonRoot
        run_as_non_root: Some(false),
        privileged: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec![NET_ADMIN_CAPABILITY.to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Locate the service account token for ACL login.
///
/// Multiport services use their own `<service>-service-account` volume when
/// the pod has one; everything else falls back to the first container
/// mounting the default token path.
fn find_service_account_volume_mount(
    pod: &Pod,
    multiport_service: Option<&str>,
) -> Result<(VolumeMount, String), InjectError> {
    if let Some(service) = multiport_service {
        let volume_name = format!("{service}-service-account");
        let has_volume = pod
            .spec
            .iter()
            .flat_map(|spec| spec.volumes.iter().flatten())
            .any(|volume| volume.name == volume_name);
        if has_volume {
            let mount_path = format!("/consul/serviceaccount-{service}");
            let token_file = format!("{mount_path}/token");
            return Ok((
                VolumeMount {
                    name: volume_name,
                    mount_path,
                    read_only: Some(true),
                    ..Default::default()
                },
                token_file,
            ));
        }
    }

    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .find(|mount| mount.mount_path == SERVICE_ACCOUNT_MOUNT_PATH)
        .map(|mount| (mount.clone(), format!("{SERVICE_ACCOUNT_MOUNT_PATH}/token")))
        .ok_or(InjectError::ServiceAccountMountNotFound)
}

#[cfg(test)]
#[path = "container_init_test.rs"]
mod tests;
