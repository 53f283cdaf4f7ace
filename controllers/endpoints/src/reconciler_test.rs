use super::*;
use crate::agents::MockAgentFactory;
use crate::lookup::InMemoryLookup;
use connect_inject::annotations::{ANNOTATION_PORT, ANNOTATION_SERVICE, ANNOTATION_STATUS, INJECTED};
use consul_client::{AgentServiceRegistration, MockCall, MockConsulClient};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, ObjectReference, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};

const AGENT_1: &str = "10.1.1.1";
const AGENT_2: &str = "10.1.1.2";

struct Fixture {
    lookup: Arc<InMemoryLookup>,
    agent1: MockConsulClient,
    agent2: MockConsulClient,
    reconciler: Reconciler,
}

fn fixture(vars: &[(&str, &str)]) -> Fixture {
    let env: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let config = Arc::new(ControllerConfig::from_source(&env).unwrap());

    let lookup = Arc::new(InMemoryLookup::new());
    lookup.add_pod(agent_pod("consul-client-1", AGENT_1));
    lookup.add_pod(agent_pod("consul-client-2", AGENT_2));

    let agents = Arc::new(MockAgentFactory::new());
    let agent1 = agents.add_agent(AGENT_1);
    let agent2 = agents.add_agent(AGENT_2);

    let reconciler = Reconciler::new(
        config,
        lookup.clone(),
        agents,
        Arc::new(MockConsulClient::new("http://127.0.0.1:8500")),
    );
    Fixture {
        lookup,
        agent1,
        agent2,
        reconciler,
    }
}

fn agent_pod(name: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(BTreeMap::from([
                ("component".to_string(), "client".to_string()),
                ("app".to_string(), "consul".to_string()),
                ("release".to_string(), "consul".to_string()),
            ])),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            host_ip: Some(ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn app_pod(name: &str, ip: &str, host_ip: &str, annotations: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            host_ip: Some(host_ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn injected_pod(name: &str, ip: &str, host_ip: &str) -> Pod {
    app_pod(name, ip, host_ip, &[(ANNOTATION_STATUS, INJECTED)])
}

fn pod_address(pod: &str, ip: &str) -> EndpointAddress {
    EndpointAddress {
        ip: ip.to_string(),
        target_ref: Some(ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(pod.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoints(namespace: &str, name: &str, ready: Vec<EndpointAddress>, not_ready: Vec<EndpointAddress>) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(ready),
            not_ready_addresses: Some(not_ready),
            ..Default::default()
        }]),
    }
}

/// An instance as a previous pass would have left it
fn registration(id: &str, k8s_service: &str, address: &str) -> AgentServiceRegistration {
    AgentServiceRegistration {
        id: id.to_string(),
        name: k8s_service.to_string(),
        address: address.to_string(),
        meta: BTreeMap::from([
            ("k8s-service-name".to_string(), k8s_service.to_string()),
            ("k8s-namespace".to_string(), "default".to_string()),
        ]),
        ..Default::default()
    }
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[tokio::test]
async fn test_registers_service_then_proxy_on_host_agent() {
    let f = fixture(&[]);
    f.lookup.add_pod(injected_pod("pod1", "1.2.3.4", AGENT_2));
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![pod_address("pod1", "1.2.3.4")], vec![]));

    f.reconciler.reconcile("default", "web").await.unwrap();

    assert_eq!(f.agent2.registered_ids(), vec!["pod1-web", "pod1-web-sidecar-proxy"]);
    assert!(f.agent1.registered_ids().is_empty());

    let service = f.agent2.service("pod1-web").unwrap();
    assert_eq!(service.address, "1.2.3.4");
    assert_eq!(service.meta.get("pod-name").map(String::as_str), Some("pod1"));
    assert_eq!(service.meta.get("k8s-service-name").map(String::as_str), Some("web"));
    assert_eq!(service.meta.get("k8s-namespace").map(String::as_str), Some("default"));

    // Both agents are swept for the service after registering
    let expression = r#"Meta["k8s-service-name"] == "web" and Meta["k8s-namespace"] == "default""#;
    assert_eq!(f.agent1.calls(), vec![MockCall::ListServices(expression.to_string())]);
    assert_eq!(f.agent2.calls().last(), Some(&MockCall::ListServices(expression.to_string())));
    assert!(f.agent2.deregistered_ids().is_empty());
}

#[tokio::test]
async fn test_not_ready_addresses_are_registered() {
    let f = fixture(&[]);
    f.lookup.add_pod(injected_pod("pod1", "1.2.3.4", AGENT_1));
    f.lookup.add_pod(injected_pod("pod2", "2.2.3.4", AGENT_1));
    f.lookup.set_endpoints(endpoints(
        "default",
        "web",
        vec![pod_address("pod1", "1.2.3.4")],
        vec![pod_address("pod2", "2.2.3.4")],
    ));

    f.reconciler.reconcile("default", "web").await.unwrap();

    assert_eq!(
        f.agent1.service_ids(),
        vec!["pod1-web", "pod1-web-sidecar-proxy", "pod2-web", "pod2-web-sidecar-proxy"]
    );
}

#[tokio::test]
async fn test_convergence_deregisters_only_removed_address() {
    let f = fixture(&[]);
    f.lookup.add_pod(injected_pod("pod-a", "1.1.1.1", AGENT_1));
    f.lookup.add_pod(injected_pod("pod-b", "2.2.2.2", AGENT_1));
    f.lookup.add_pod(injected_pod("pod-c", "3.3.3.3", AGENT_2));
    f.lookup.set_endpoints(endpoints(
        "default",
        "web",
        vec![
            pod_address("pod-c", "3.3.3.3"),
            pod_address("pod-b", "2.2.2.2"),
            pod_address("pod-a", "1.1.1.1"),
        ],
        vec![],
    ));
    f.reconciler.reconcile("default", "web").await.unwrap();
    assert_eq!(f.agent1.service_ids().len(), 4);
    assert_eq!(f.agent2.service_ids().len(), 2);

    // Re-running with an unchanged set removes nothing
    f.reconciler.reconcile("default", "web").await.unwrap();
    assert!(f.agent1.deregistered_ids().is_empty());
    assert!(f.agent2.deregistered_ids().is_empty());

    f.lookup.set_endpoints(endpoints(
        "default",
        "web",
        vec![pod_address("pod-a", "1.1.1.1"), pod_address("pod-c", "3.3.3.3")],
        vec![],
    ));
    f.reconciler.reconcile("default", "web").await.unwrap();

    assert_eq!(
        sorted(f.agent1.deregistered_ids()),
        vec!["pod-b-web", "pod-b-web-sidecar-proxy"]
    );
    assert!(f.agent2.deregistered_ids().is_empty());
    assert_eq!(f.agent1.service_ids(), vec!["pod-a-web", "pod-a-web-sidecar-proxy"]);
    assert_eq!(f.agent2.service_ids(), vec!["pod-c-web", "pod-c-web-sidecar-proxy"]);
}

#[tokio::test]
async fn test_deleted_endpoints_deregister_everything() {
    let f = fixture(&[]);
    f.agent1.add_service(registration("pod-a-web", "web", "1.1.1.1"));
    f.agent1.add_service(registration("pod-a-web-sidecar-proxy", "web", "1.1.1.1"));
    f.agent2.add_service(registration("pod-c-web", "web", "3.3.3.3"));
    f.agent2.add_service(registration("pod-x-api", "api", "4.4.4.4"));

    f.reconciler.reconcile("default", "web").await.unwrap();

    assert_eq!(
        sorted(f.agent1.deregistered_ids()),
        vec!["pod-a-web", "pod-a-web-sidecar-proxy"]
    );
    assert_eq!(f.agent2.deregistered_ids(), vec!["pod-c-web"]);
    assert!(f.agent1.registered_ids().is_empty());
    assert!(f.agent2.registered_ids().is_empty());
    // Other services are left alone
    assert_eq!(f.agent2.service_ids(), vec!["pod-x-api"]);
}

#[tokio::test]
async fn test_renamed_consul_service_is_swept_by_metadata() {
    let f = fixture(&[]);
    f.lookup.add_pod(app_pod(
        "pod1",
        "1.2.3.4",
        AGENT_1,
        &[(ANNOTATION_STATUS, INJECTED), (ANNOTATION_SERVICE, "frontend")],
    ));
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![pod_address("pod1", "1.2.3.4")], vec![]));
    f.reconciler.reconcile("default", "web").await.unwrap();
    assert_eq!(f.agent1.service_ids(), vec!["pod1-frontend", "pod1-frontend-sidecar-proxy"]);

    f.lookup.delete_endpoints("default", "web");
    f.reconciler.reconcile("default", "web").await.unwrap();
    assert!(f.agent1.service_ids().is_empty());
}

#[tokio::test]
async fn test_non_injected_pods_are_not_registered() {
    let f = fixture(&[]);
    f.lookup.add_pod(app_pod("pod1", "1.2.3.4", AGENT_1, &[]));
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![pod_address("pod1", "1.2.3.4")], vec![]));
    f.agent1.add_service(registration("pod1-web", "web", "1.2.3.4"));

    f.reconciler.reconcile("default", "web").await.unwrap();

    assert!(f.agent1.registered_ids().is_empty());
    // Still listed, so its existing instance survives the sweep
    assert!(f.agent1.deregistered_ids().is_empty());
}

#[tokio::test]
async fn test_addresses_without_pod_target_are_skipped() {
    let f = fixture(&[]);
    let node_address = EndpointAddress {
        ip: "5.5.5.5".to_string(),
        target_ref: Some(ObjectReference {
            kind: Some("Node".to_string()),
            name: Some("node-1".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let bare_address = EndpointAddress {
        ip: "6.6.6.6".to_string(),
        ..Default::default()
    };
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![node_address, bare_address], vec![]));
    f.agent1.add_service(registration("old-web", "web", "5.5.5.5"));

    f.reconciler.reconcile("default", "web").await.unwrap();

    assert!(f.agent1.registered_ids().is_empty());
    assert_eq!(f.agent1.deregistered_ids(), vec!["old-web"]);
}

#[tokio::test]
async fn test_ignored_namespaces_are_a_no_op() {
    for (vars, namespace) in [
        (vec![], "kube-system"),
        (vec![("DENY_K8S_NAMESPACES", "team-a")], "team-a"),
        (vec![("ALLOW_K8S_NAMESPACES", "team-b")], "team-a"),
    ] {
        let f = fixture(&vars);
        f.lookup.add_pod(injected_pod("pod1", "1.2.3.4", AGENT_1));
        f.lookup
            .set_endpoints(endpoints(namespace, "web", vec![pod_address("pod1", "1.2.3.4")], vec![]));

        f.reconciler.reconcile(namespace, "web").await.unwrap();

        assert!(f.agent1.calls().is_empty(), "{namespace}");
        assert!(f.agent2.calls().is_empty(), "{namespace}");
    }
}

#[tokio::test]
async fn test_registration_failure_aborts_pass() {
    let f = fixture(&[]);
    f.agent1.fail_registrations();
    f.agent2.add_service(registration("stale-web", "web", "9.9.9.9"));
    f.lookup.add_pod(injected_pod("pod1", "1.2.3.4", AGENT_1));
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![pod_address("pod1", "1.2.3.4")], vec![]));

    let err = f.reconciler.reconcile("default", "web").await.unwrap_err();

    assert!(matches!(err, ControllerError::Consul(_)));
    // Service attempted, proxy never reached, no sweep
    assert_eq!(f.agent1.calls(), vec![MockCall::Register("pod1-web".to_string())]);
    assert!(f.agent2.calls().is_empty());
    assert_eq!(f.agent2.service_ids(), vec!["stale-web"]);
}

#[tokio::test]
async fn test_missing_pod_aborts_pass() {
    let f = fixture(&[]);
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![pod_address("gone", "1.2.3.4")], vec![]));

    let err = f.reconciler.reconcile("default", "web").await.unwrap_err();

    assert!(matches!(err, ControllerError::PodNotFound(ref key) if key == "default/gone"));
    assert!(f.agent1.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_annotation_aborts_pass() {
    let f = fixture(&[]);
    f.lookup.add_pod(app_pod(
        "pod1",
        "1.2.3.4",
        AGENT_1,
        &[(ANNOTATION_STATUS, INJECTED), (ANNOTATION_PORT, "grpc")],
    ));
    f.lookup
        .set_endpoints(endpoints("default", "web", vec![pod_address("pod1", "1.2.3.4")], vec![]));

    let err = f.reconciler.reconcile("default", "web").await.unwrap_err();

    assert!(matches!(err, ControllerError::Inject(_)));
    assert!(f.agent1.registered_ids().is_empty());
}

#[tokio::test]
async fn test_agents_from_other_releases_are_not_swept() {
    let f = fixture(&[("RELEASE_NAME", "mesh")]);
    f.agent1.add_service(registration("pod-a-web", "web", "1.1.1.1"));

    f.reconciler.reconcile("default", "web").await.unwrap();

    assert!(f.agent1.calls().is_empty());
    assert_eq!(f.agent1.service_ids(), vec!["pod-a-web"]);
}
