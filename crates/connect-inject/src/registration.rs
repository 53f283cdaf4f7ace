//! Service and sidecar proxy registrations for one endpoint pod

use crate::annotations::{
    non_empty_annotation, port_value, ANNOTATION_CONNECT_TAGS, ANNOTATION_META_PREFIX, ANNOTATION_PORT,
    ANNOTATION_SERVICE, ANNOTATION_TAGS, META_KEY_KUBE_NS, META_KEY_KUBE_SERVICE_NAME,
    META_KEY_POD_NAME,
};
use crate::error::InjectError;
use crate::upstreams::process_upstreams;
use consul_client::{
    AgentServiceCheck, AgentServiceConnectProxyConfig, AgentServiceRegistration, ConsulClientTrait,
    ServiceKind,
};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Public listener port of every sidecar proxy
pub const PROXY_DEFAULT_INBOUND_PORT: i32 = 20000;

/// Kubernetes service owning the endpoints a pod was found in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOwner {
    pub name: String,
    pub namespace: String,
}

/// The pair of registrations made for each injected pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistrations {
    pub service: AgentServiceRegistration,
    pub proxy: AgentServiceRegistration,
}

/// Builds registrations; `consul` is the client used for the upstream
/// mesh gateway check.
pub struct RegistrationBuilder<'a> {
    consul: &'a dyn ConsulClientTrait,
}

impl std::fmt::Debug for RegistrationBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationBuilder")
            .field("consul", &self.consul.address())
            .finish()
    }
}

impl<'a> RegistrationBuilder<'a> {
    pub fn new(consul: &'a dyn ConsulClientTrait) -> Self {
        Self { consul }
    }

    /// Build the service and proxy registrations for `pod`.
    ///
    /// IDs are `<pod>-<service>` and `<pod>-<service>-sidecar-proxy`, so
    /// rebuilding from the same pod always yields the same records.
    pub async fn build(&self, pod: &Pod, owner: &EndpointOwner) -> Result<ServiceRegistrations, InjectError> {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.clone())
            .unwrap_or_default();

        let service_port = match non_empty_annotation(pod, ANNOTATION_PORT) {
            Some(raw) => port_value(pod, ANNOTATION_PORT, raw)?.max(0),
            None => 0,
        };

        let service_name = non_empty_annotation(pod, ANNOTATION_SERVICE)
            .unwrap_or(&owner.name)
            .to_string();
        let service_id = format!("{pod_name}-{service_name}");

        let mut meta: BTreeMap<String, String> = pod
            .metadata
            .annotations
            .iter()
            .flatten()
            .filter_map(|(key, value)| {
                key.strip_prefix(ANNOTATION_META_PREFIX)
                    .filter(|k| !k.is_empty())
                    .map(|k| (k.to_string(), value.clone()))
            })
            .collect();
        // Correlation keys for the deregistration sweep take precedence over user meta
        meta.insert(META_KEY_POD_NAME.to_string(), pod_name.clone());
        meta.insert(META_KEY_KUBE_SERVICE_NAME.to_string(), owner.name.clone());
        meta.insert(META_KEY_KUBE_NS.to_string(), owner.namespace.clone());

        let tags: Vec<String> = [ANNOTATION_TAGS, ANNOTATION_CONNECT_TAGS]
            .into_iter()
            .filter_map(|key| non_empty_annotation(pod, key))
            .flat_map(|raw| raw.split(','))
            .map(str::to_string)
            .collect();

        let service = AgentServiceRegistration {
            id: service_id.clone(),
            name: service_name.clone(),
            port: service_port,
            address: pod_ip.clone(),
            meta: meta.clone(),
            tags: tags.clone(),
            ..Default::default()
        };

        let proxy_name = format!("{service_name}-sidecar-proxy");
        let mut proxy_config = AgentServiceConnectProxyConfig {
            destination_service_name: service_name,
            destination_service_id: service_id.clone(),
            upstreams: process_upstreams(pod, self.consul).await?,
            ..Default::default()
        };
        if service_port > 0 {
            proxy_config.local_service_address = Some("127.0.0.1".to_string());
            proxy_config.local_service_port = Some(service_port);
        }

        let proxy = AgentServiceRegistration {
            kind: Some(ServiceKind::ConnectProxy),
            id: format!("{pod_name}-{proxy_name}"),
            name: proxy_name,
            port: PROXY_DEFAULT_INBOUND_PORT,
            address: pod_ip.clone(),
            meta,
            tags,
            proxy: Some(proxy_config),
            checks: vec![
                AgentServiceCheck {
                    name: "Proxy Public Listener".to_string(),
                    tcp: Some(format!("{pod_ip}:{PROXY_DEFAULT_INBOUND_PORT}")),
                    interval: Some("10s".to_string()),
                    deregister_critical_service_after: Some("10m".to_string()),
                    ..Default::default()
                },
                AgentServiceCheck {
                    name: "Destination Alias".to_string(),
                    alias_service: Some(service_id),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        Ok(ServiceRegistrations { service, proxy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::ANNOTATION_UPSTREAMS;
    use consul_client::{MockConsulClient, Upstream, UpstreamDestType};
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod1".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("http".to_string()),
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("1.2.3.4".to_string()),
                host_ip: Some("127.0.0.1".to_string()),
                ..Default::default()
            }),
        }
    }

    fn owner() -> EndpointOwner {
        EndpointOwner {
            name: "service-created".to_string(),
            namespace: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_basic_registrations() {
        let consul = MockConsulClient::new("http://127.0.0.1:8500");
        let registrations = RegistrationBuilder::new(&consul)
            .build(&pod(&[]), &owner())
            .await
            .unwrap();

        let service = registrations.service;
        assert_eq!(service.id, "pod1-service-created");
        assert_eq!(service.name, "service-created");
        assert_eq!(service.port, 0);
        assert_eq!(service.address, "1.2.3.4");
        assert!(service.tags.is_empty());
        assert_eq!(
            service.meta,
            BTreeMap::from([
                ("pod-name".to_string(), "pod1".to_string()),
                ("k8s-service-name".to_string(), "service-created".to_string()),
                ("k8s-namespace".to_string(), "default".to_string()),
            ])
        );

        let proxy = registrations.proxy;
        assert_eq!(proxy.kind, Some(ServiceKind::ConnectProxy));
        assert_eq!(proxy.id, "pod1-service-created-sidecar-proxy");
        assert_eq!(proxy.name, "service-created-sidecar-proxy");
        assert_eq!(proxy.port, 20000);
        let config = proxy.proxy.unwrap();
        assert_eq!(config.destination_service_name, "service-created");
        assert_eq!(config.destination_service_id, "pod1-service-created");
        assert_eq!(config.local_service_address, None);
        assert_eq!(config.local_service_port, None);
        assert_eq!(
            proxy.checks,
            vec![
                AgentServiceCheck {
                    name: "Proxy Public Listener".to_string(),
                    tcp: Some("1.2.3.4:20000".to_string()),
                    interval: Some("10s".to_string()),
                    deregister_critical_service_after: Some("10m".to_string()),
                    ..Default::default()
                },
                AgentServiceCheck {
                    name: "Destination Alias".to_string(),
                    alias_service: Some("pod1-service-created".to_string()),
                    ..Default::default()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_annotations_override_and_augment() {
        let consul = MockConsulClient::new("http://127.0.0.1:8500");
        let pod = pod(&[
            (ANNOTATION_SERVICE, "different-consul-svc-name"),
            (ANNOTATION_PORT, "http"),
            (ANNOTATION_TAGS, "abc,123"),
            (ANNOTATION_CONNECT_TAGS, "def,456,abc"),
            ("consul.hashicorp.com/service-meta-name", "abc"),
            ("consul.hashicorp.com/service-meta-version", "2"),
            ("consul.hashicorp.com/service-meta-", "ignored"),
            (ANNOTATION_UPSTREAMS, "upstream1:1234"),
        ]);
        let registrations = RegistrationBuilder::new(&consul).build(&pod, &owner()).await.unwrap();

        let service = registrations.service;
        assert_eq!(service.id, "pod1-different-consul-svc-name");
        assert_eq!(service.port, 8080);
        // Both tag annotations, in order, duplicates kept
        assert_eq!(service.tags, vec!["abc", "123", "def", "456", "abc"]);
        assert_eq!(service.meta.get("name"), Some(&"abc".to_string()));
        assert_eq!(service.meta.get("version"), Some(&"2".to_string()));
        assert_eq!(service.meta.get("k8s-service-name"), Some(&"service-created".to_string()));
        assert_eq!(service.meta.len(), 5);

        let proxy = registrations.proxy;
        assert_eq!(proxy.tags, service.tags);
        assert_eq!(proxy.meta, service.meta);
        let config = proxy.proxy.unwrap();
        assert_eq!(config.local_service_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.local_service_port, Some(8080));
        assert_eq!(
            config.upstreams,
            vec![Upstream {
                destination_type: UpstreamDestType::Service,
                destination_namespace: String::new(),
                destination_name: "upstream1".to_string(),
                datacenter: String::new(),
                local_bind_port: 1234,
            }]
        );
    }

    #[tokio::test]
    async fn test_user_meta_cannot_replace_correlation_keys() {
        let consul = MockConsulClient::new("http://127.0.0.1:8500");
        let pod = pod(&[
            ("consul.hashicorp.com/service-meta-k8s-service-name", "other"),
            ("consul.hashicorp.com/service-meta-k8s-namespace", "elsewhere"),
            ("consul.hashicorp.com/service-meta-pod-name", "pod2"),
        ]);
        let registrations = RegistrationBuilder::new(&consul).build(&pod, &owner()).await.unwrap();

        let expected = BTreeMap::from([
            ("pod-name".to_string(), "pod1".to_string()),
            ("k8s-service-name".to_string(), "service-created".to_string()),
            ("k8s-namespace".to_string(), "default".to_string()),
        ]);
        assert_eq!(registrations.service.meta, expected);
        assert_eq!(registrations.proxy.meta, expected);
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let consul = MockConsulClient::new("http://127.0.0.1:8500");
        let pod = pod(&[(ANNOTATION_PORT, "8080"), ("consul.hashicorp.com/service-meta-team", "mesh")]);
        let builder = RegistrationBuilder::new(&consul);
        let first = builder.build(&pod, &owner()).await.unwrap();
        let second = builder.build(&pod, &owner()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.service).unwrap(),
            serde_json::to_string(&second.service).unwrap()
        );
    }

    #[tokio::test]
    async fn test_invalid_port_annotation() {
        let consul = MockConsulClient::new("http://127.0.0.1:8500");
        let err = RegistrationBuilder::new(&consul)
            .build(&pod(&[(ANNOTATION_PORT, "grpc")]), &owner())
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::InvalidPort { .. }));
    }
}
