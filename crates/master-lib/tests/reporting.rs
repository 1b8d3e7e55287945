//! End-to-end tests of the reporting pipeline against in-memory stores

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use master_lib::locks::NodeLocks;
use master_lib::patch::StatusOp;
use master_lib::proto::topology;
use master_lib::proto::NodeTopologyRequest;
use master_lib::reconcile::{LabelReconciler, TopologyOutcome};
use master_lib::store::{InMemoryNodeStore, InMemoryTopologyStore, NodeStore};
use master_lib::{
    AuthorizationError, FeatureClassifier, FeatureReport, HealthRegistry, MasterError,
    MasterMetrics, PeerAuthenticator, PeerIdentity, PruneError, Pruner, ReportingService,
    ServiceConfig, StoreError, StructuredLogger,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn report(node: &str, labels: &[(&str, &str)]) -> FeatureReport {
    FeatureReport {
        node_name: node.into(),
        agent_version: "v0.7.0".into(),
        labels: map(labels),
    }
}

fn peer_with_cn(common_name: &str) -> PeerIdentity {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    let key_pair = KeyPair::generate().unwrap();
    let der = params.self_signed(&key_pair).unwrap().der().to_vec();
    PeerIdentity::with_certificates(Some("10.0.0.7:51234".parse().unwrap()), vec![der])
}

struct Harness {
    nodes: Arc<InMemoryNodeStore>,
    topologies: Arc<InMemoryTopologyStore>,
    service: ReportingService,
}

fn harness(config: ServiceConfig, verify_node_name: bool, classifier: FeatureClassifier) -> Harness {
    let nodes = Arc::new(InMemoryNodeStore::with_nodes(["n1", "n2"]));
    let topologies = Arc::new(InMemoryTopologyStore::new());
    let service = ReportingService::new(
        config,
        Arc::new(PeerAuthenticator::new(verify_node_name)),
        classifier,
        nodes.clone(),
        topologies.clone(),
        MasterMetrics::new().unwrap(),
        HealthRegistry::new(),
    );
    Harness {
        nodes,
        topologies,
        service,
    }
}

fn gpu_classifier() -> FeatureClassifier {
    FeatureClassifier::new(
        vec!["feature.node.kubernetes.io".into()],
        None,
        vec!["gpu".into()],
    )
}

fn topology_request(node: &str, zone_names: &[&str]) -> NodeTopologyRequest {
    let zones = zone_names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                topology::Zone {
                    r#type: "Node".into(),
                    resources: BTreeMap::from([(
                        "cpu".to_string(),
                        topology::ResourceInfo {
                            allocatable: 3,
                            capacity: 4,
                        },
                    )]),
                    ..Default::default()
                },
            )
        })
        .collect();

    NodeTopologyRequest {
        nfd_version: "v0.7.0".into(),
        node_name: node.into(),
        topology_policies: vec!["single-numa-node".into()],
        zones,
    }
}

#[tokio::test]
async fn test_end_to_end_labels_and_resources() {
    let h = harness(ServiceConfig::default(), true, gpu_classifier());

    let update = h
        .service
        .handle_set_labels(
            &peer_with_cn("n1"),
            report("n1", &[("cpu-model", "xeon"), ("gpu", "4")]),
        )
        .await
        .unwrap()
        .expect("publishing enabled");
    assert_eq!(update.status_ops.len(), 1);

    let node = h.nodes.node("n1").unwrap();
    let labels = node.metadata.labels.unwrap();
    assert_eq!(labels, map(&[("feature.node.kubernetes.io/cpu-model", "xeon")]));

    let annotations = node.metadata.annotations.unwrap();
    assert_eq!(
        annotations["nfd.node.kubernetes.io/feature-labels"],
        "feature.node.kubernetes.io/cpu-model"
    );
    assert_eq!(
        annotations["nfd.node.kubernetes.io/extended-resources"],
        "gpu"
    );
    assert_eq!(annotations["nfd.node.kubernetes.io/worker.version"], "v0.7.0");

    let status = node.status.unwrap();
    assert_eq!(
        status.capacity.unwrap()["feature.node.kubernetes.io/gpu"],
        Quantity("4".into())
    );
}

#[tokio::test]
async fn test_mismatched_certificate_mutates_nothing() {
    let h = harness(ServiceConfig::default(), true, gpu_classifier());

    let err = h
        .service
        .handle_set_labels(&peer_with_cn("n2"), report("n1", &[("cpu-model", "xeon")]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MasterError::Authorization(AuthorizationError::NodeNameMismatch { .. })
    ));
    assert_eq!(h.nodes.update_count(), 0);
    assert!(h.nodes.patches().is_empty());

    let err = h
        .service
        .handle_update_topology(&peer_with_cn("n2"), topology_request("n1", &["node-0"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Authorization(_)));
    assert_eq!(h.topologies.create_count(), 0);
}

#[tokio::test]
async fn test_disallowed_namespace_is_never_published() {
    let classifier = FeatureClassifier::new(
        vec!["feature.node.kubernetes.io".into(), "vendor.io".into()],
        Some(Regex::new("^cpu-").unwrap()),
        Vec::new(),
    );
    let h = harness(ServiceConfig::default(), false, classifier);

    h.service
        .handle_set_labels(
            &PeerIdentity::default(),
            report(
                "n1",
                &[
                    ("cpu-model", "xeon"),
                    ("other.io/cpu-model", "xeon"),
                    ("vendor.io/cpu-flags", "avx"),
                    ("memory-numa", "true"),
                ],
            ),
        )
        .await
        .unwrap();

    let labels = h.nodes.node("n1").unwrap().metadata.labels.unwrap();
    assert_eq!(
        labels,
        map(&[
            ("feature.node.kubernetes.io/cpu-model", "xeon"),
            ("vendor.io/cpu-flags", "avx"),
        ])
    );
}

#[tokio::test]
async fn test_no_publish_mutates_nothing() {
    let config = ServiceConfig {
        publish: false,
        ..ServiceConfig::default()
    };
    let h = harness(config, false, gpu_classifier());
    let peer = PeerIdentity::default();

    let update = h
        .service
        .handle_set_labels(&peer, report("n1", &[("gpu", "4")]))
        .await
        .unwrap();
    let outcome = h
        .service
        .handle_update_topology(&peer, topology_request("n1", &["node-0"]))
        .await
        .unwrap();

    assert!(update.is_none());
    assert!(outcome.is_none());
    assert_eq!(h.nodes.update_count(), 0);
    assert!(h.nodes.patches().is_empty());
    assert_eq!(h.topologies.create_count(), 0);
}

#[tokio::test]
async fn test_topology_create_then_update() {
    let config = ServiceConfig {
        topology_namespace: "nfd".into(),
        ..ServiceConfig::default()
    };
    let h = harness(config, true, gpu_classifier());
    let peer = peer_with_cn("n1");

    let first = h
        .service
        .handle_update_topology(&peer, topology_request("n1", &["node-0", "node-1"]))
        .await
        .unwrap();
    let second = h
        .service
        .handle_update_topology(&peer, topology_request("n1", &["node-1"]))
        .await
        .unwrap();

    assert_eq!(first, Some(TopologyOutcome::Created));
    assert_eq!(second, Some(TopologyOutcome::Updated));
    let record = h.topologies.record("nfd", "n1").unwrap();
    assert_eq!(record.zones.keys().collect::<Vec<_>>(), vec!["node-1"]);
    assert!(h.topologies.record("default", "n1").is_none());
}

/// Node store that hands control back to the scheduler around every call,
/// so concurrent reconciles interleave between fetch and replace.
struct YieldingNodeStore {
    inner: Arc<InMemoryNodeStore>,
}

#[async_trait]
impl NodeStore for YieldingNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        let node = self.inner.get_node(name).await;
        tokio::task::yield_now().await;
        node
    }

    async fn update_node(&self, node: &Node) -> Result<Node, StoreError> {
        tokio::task::yield_now().await;
        self.inner.update_node(node).await
    }

    async fn patch_status(&self, name: &str, ops: &[StatusOp]) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.patch_status(name, ops).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.inner.list_nodes().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reports_for_one_node_are_serialized() {
    let nodes = Arc::new(InMemoryNodeStore::with_nodes(["n1"]));
    let service = Arc::new(ReportingService::new(
        ServiceConfig::default(),
        Arc::new(PeerAuthenticator::disabled()),
        gpu_classifier(),
        Arc::new(YieldingNodeStore {
            inner: nodes.clone(),
        }),
        Arc::new(InMemoryTopologyStore::new()),
        MasterMetrics::new().unwrap(),
        HealthRegistry::new(),
    ));

    let mut handles = Vec::new();
    for i in 1..=8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let value = i.to_string();
            service
                .handle_set_labels(
                    &PeerIdentity::default(),
                    report("n1", &[("counter", value.as_str()), ("gpu", value.as_str())]),
                )
                .await
        }));
    }

    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => {}
            Err(MasterError::Store(StoreError::Conflict { .. })) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(conflicts, 0);
    assert_eq!(nodes.update_count(), 8);
    // Every report saw the previous one's capacity: one add, then replaces
    assert_eq!(nodes.patches().len(), 8);
}

#[tokio::test]
async fn test_prune_clears_everything_published() {
    let h = harness(ServiceConfig::default(), false, gpu_classifier());
    let peer = PeerIdentity::default();
    for node in ["n1", "n2"] {
        h.service
            .handle_set_labels(&peer, report(node, &[("cpu-model", "xeon"), ("gpu", "2")]))
            .await
            .unwrap();
    }

    let pruner = Pruner::new(
        LabelReconciler::new(h.nodes.clone(), NodeLocks::new()),
        StructuredLogger::new("master-0"),
    );
    assert_eq!(pruner.prune().await.unwrap(), 2);

    for node in ["n1", "n2"] {
        let node = h.nodes.node(node).unwrap();
        assert!(node.metadata.labels.unwrap_or_default().is_empty());
        assert!(node.metadata.annotations.unwrap_or_default().is_empty());
        let status = node.status.unwrap();
        assert!(status.capacity.unwrap_or_default().is_empty());
        assert!(status.allocatable.unwrap_or_default().is_empty());
    }
}

#[tokio::test]
async fn test_prune_stops_at_first_failure() {
    let h = harness(ServiceConfig::default(), false, gpu_classifier());
    h.service
        .handle_set_labels(&PeerIdentity::default(), report("n1", &[("gpu", "2")]))
        .await
        .unwrap();
    h.nodes.fail_next_patch();

    let pruner = Pruner::new(
        LabelReconciler::new(h.nodes.clone(), NodeLocks::new()),
        StructuredLogger::new("master-0"),
    );
    let err = pruner.prune().await.unwrap_err();

    match err {
        PruneError::Node { node, source } => {
            assert_eq!(node, "n1");
            assert!(matches!(source, MasterError::StatusPatch { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}
