//! gRPC reporting service
//!
//! Both RPCs run the same pipeline: authorize the peer against the node
//! name in the request, then (unless publishing is disabled) hand the
//! report to the matching reconciler. The first error is returned to the
//! worker as a gRPC status.

use crate::auth::{Authorizer, PeerIdentity};
use crate::classify::FeatureClassifier;
use crate::error::MasterError;
use crate::health::{components, HealthRegistry};
use crate::locks::NodeLocks;
use crate::models::{
    annotations, join_key_list, qualify_label, Annotations, ExtendedResources, FeatureReport,
    Labels,
};
use crate::observability::{operations, MasterMetrics};
use crate::proto::{
    Labeler, NodeTopology, NodeTopologyRequest, NodeTopologyResponse, SetLabelsReply,
    SetLabelsRequest,
};
use crate::reconcile::{LabelReconciler, LabelUpdate, TopologyOutcome, TopologyReconciler};
use crate::store::{NodeStore, TopologyStore};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Namespace for NodeResourceTopology records unless configured otherwise
pub const DEFAULT_TOPOLOGY_NAMESPACE: &str = "default";

/// Behaviour switches of the reporting service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Write reports into the cluster. When false, requests are only
    /// authorized, classified and logged.
    pub publish: bool,
    pub topology_namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            publish: true,
            topology_namespace: DEFAULT_TOPOLOGY_NAMESPACE.to_string(),
        }
    }
}

/// Bookkeeping annotations stored alongside a published label set.
///
/// `feature-labels` lists namespace-qualified label keys; `extended-resources`
/// lists bare resource names.
pub fn bookkeeping_annotations(
    agent_version: &str,
    labels: &Labels,
    extended_resources: &ExtendedResources,
) -> Annotations {
    let label_keys: Vec<String> = labels.keys().map(|k| qualify_label(k)).collect();

    let mut out = Annotations::new();
    out.insert(
        annotations::WORKER_VERSION.to_string(),
        agent_version.to_string(),
    );
    out.insert(
        annotations::FEATURE_LABELS.to_string(),
        join_key_list(&label_keys),
    );
    out.insert(
        annotations::EXTENDED_RESOURCES.to_string(),
        join_key_list(extended_resources.keys()),
    );
    out
}

/// Implements the `Labeler` and `NodeTopology` gRPC services
#[derive(Clone)]
pub struct ReportingService {
    config: ServiceConfig,
    authorizer: Arc<dyn Authorizer>,
    classifier: FeatureClassifier,
    labels: LabelReconciler,
    topology: TopologyReconciler,
    metrics: MasterMetrics,
    health: HealthRegistry,
}

impl ReportingService {
    pub fn new(
        config: ServiceConfig,
        authorizer: Arc<dyn Authorizer>,
        classifier: FeatureClassifier,
        node_store: Arc<dyn NodeStore>,
        topology_store: Arc<dyn TopologyStore>,
        metrics: MasterMetrics,
        health: HealthRegistry,
    ) -> Self {
        let locks = NodeLocks::new();
        Self {
            config,
            authorizer,
            classifier,
            labels: LabelReconciler::new(node_store, locks.clone()),
            topology: TopologyReconciler::new(topology_store, locks),
            metrics,
            health,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Handle one feature report. Returns `None` when publishing is disabled.
    pub async fn handle_set_labels(
        &self,
        peer: &PeerIdentity,
        report: FeatureReport,
    ) -> Result<Option<LabelUpdate>, MasterError> {
        let started = Instant::now();
        let result = self.set_labels_inner(peer, &report).await;
        self.finish(operations::SET_LABELS, components::NODE_STORE, &result, started)
            .await;
        result
    }

    async fn set_labels_inner(
        &self,
        peer: &PeerIdentity,
        report: &FeatureReport,
    ) -> Result<Option<LabelUpdate>, MasterError> {
        info!(
            event = "set_labels",
            node = %report.node_name,
            agent_version = %report.agent_version,
            labels = report.labels.len(),
            "Received feature report"
        );

        self.authorizer.authorize(peer, &report.node_name)?;

        let classification = self.classifier.classify(&report.labels);
        self.metrics.inc_rejected(&classification.rejected);

        if !self.config.publish {
            debug!(
                node = %report.node_name,
                labels = classification.labels.len(),
                resources = classification.extended_resources.len(),
                "Publishing disabled, dropping report"
            );
            return Ok(None);
        }

        let annotations = bookkeeping_annotations(
            &report.agent_version,
            &classification.labels,
            &classification.extended_resources,
        );
        let update = self
            .labels
            .reconcile(
                &report.node_name,
                &classification.labels,
                &annotations,
                &classification.extended_resources,
            )
            .await?;
        self.metrics.add_status_ops(update.status_ops.len());
        Ok(Some(update))
    }

    /// Handle one topology report. Returns `None` when publishing is disabled.
    pub async fn handle_update_topology(
        &self,
        peer: &PeerIdentity,
        request: NodeTopologyRequest,
    ) -> Result<Option<TopologyOutcome>, MasterError> {
        let started = Instant::now();
        let result = self.update_topology_inner(peer, &request).await;
        self.finish(
            operations::UPDATE_TOPOLOGY,
            components::TOPOLOGY_STORE,
            &result,
            started,
        )
        .await;
        result
    }

    async fn update_topology_inner(
        &self,
        peer: &PeerIdentity,
        request: &NodeTopologyRequest,
    ) -> Result<Option<TopologyOutcome>, MasterError> {
        info!(
            event = "update_node_topology",
            node = %request.node_name,
            agent_version = %request.nfd_version,
            zones = request.zones.len(),
            "Received topology report"
        );

        self.authorizer.authorize(peer, &request.node_name)?;

        if !self.config.publish {
            return Ok(None);
        }

        let outcome = self
            .topology
            .reconcile(
                &request.node_name,
                &request.topology_policies,
                &request.zones,
                &self.config.topology_namespace,
            )
            .await?;
        Ok(Some(outcome))
    }

    async fn finish<T>(
        &self,
        operation: &str,
        store: &str,
        result: &Result<T, MasterError>,
        started: Instant,
    ) {
        self.metrics
            .observe_request(operation, result.is_ok(), started.elapsed().as_secs_f64());

        match result {
            Ok(_) => self.health.set_healthy(store).await,
            Err(MasterError::Authorization(_)) => {}
            Err(e) => {
                warn!(operation = %operation, error = %e, "Request failed");
                self.health.set_degraded(store, e.to_string()).await;
            }
        }
    }
}

#[tonic::async_trait]
impl Labeler for ReportingService {
    async fn set_labels(
        &self,
        request: Request<SetLabelsRequest>,
    ) -> Result<Response<SetLabelsReply>, Status> {
        let peer = PeerIdentity::from_request(&request);
        let request = request.into_inner();
        let report = FeatureReport {
            node_name: request.node_name,
            agent_version: request.nfd_version,
            labels: request.labels,
        };

        self.handle_set_labels(&peer, report).await?;
        Ok(Response::new(SetLabelsReply {}))
    }
}

#[tonic::async_trait]
impl NodeTopology for ReportingService {
    async fn update_node_topology(
        &self,
        request: Request<NodeTopologyRequest>,
    ) -> Result<Response<NodeTopologyResponse>, Status> {
        let peer = PeerIdentity::from_request(&request);
        self.handle_update_topology(&peer, request.into_inner())
            .await?;
        Ok(Response::new(NodeTopologyResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PeerAuthenticator;
    use crate::store::memory::{InMemoryNodeStore, InMemoryTopologyStore};
    use std::collections::BTreeMap;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn service(
        config: ServiceConfig,
    ) -> (Arc<InMemoryNodeStore>, MasterMetrics, ReportingService) {
        let nodes = Arc::new(InMemoryNodeStore::with_nodes(["n1"]));
        let metrics = MasterMetrics::new().unwrap();
        let service = ReportingService::new(
            config,
            Arc::new(PeerAuthenticator::disabled()),
            FeatureClassifier::permissive(),
            nodes.clone(),
            Arc::new(InMemoryTopologyStore::new()),
            metrics.clone(),
            HealthRegistry::new(),
        );
        (nodes, metrics, service)
    }

    fn report(node: &str, labels: &[(&str, &str)]) -> FeatureReport {
        FeatureReport {
            node_name: node.into(),
            agent_version: "v0.7.0".into(),
            labels: map(labels),
        }
    }

    #[test]
    fn test_bookkeeping_annotations() {
        let annotations = bookkeeping_annotations(
            "v0.7.0",
            &map(&[("b", "1"), ("a", "1"), ("vendor.io/x", "1")]),
            &map(&[("gpu", "4"), ("fpga", "1")]),
        );

        assert_eq!(annotations["worker.version"], "v0.7.0");
        assert_eq!(
            annotations["feature-labels"],
            "feature.node.kubernetes.io/a,feature.node.kubernetes.io/b,vendor.io/x"
        );
        assert_eq!(annotations["extended-resources"], "fpga,gpu");
    }

    #[test]
    fn test_bookkeeping_annotations_empty_sets() {
        let annotations = bookkeeping_annotations("v0.7.0", &map(&[]), &map(&[]));
        assert_eq!(annotations["feature-labels"], "");
        assert_eq!(annotations["extended-resources"], "");
    }

    #[tokio::test]
    async fn test_requests_are_counted_by_outcome() {
        let (_, metrics, service) = service(ServiceConfig::default());
        let peer = PeerIdentity::default();

        service
            .handle_set_labels(&peer, report("n1", &[("a", "1")]))
            .await
            .unwrap();
        service
            .handle_set_labels(&peer, report("ghost", &[("a", "1")]))
            .await
            .unwrap_err();

        assert_eq!(metrics.request_count(operations::SET_LABELS, true), 1);
        assert_eq!(metrics.request_count(operations::SET_LABELS, false), 1);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_health() {
        let (_, _, service) = service(ServiceConfig::default());
        service
            .handle_set_labels(&PeerIdentity::default(), report("ghost", &[]))
            .await
            .unwrap_err();

        let health = service.health.health().await;
        assert_eq!(
            health.components[components::NODE_STORE].status,
            crate::health::ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_tonic_handler_maps_errors() {
        let (_, _, service) = service(ServiceConfig::default());
        let request = Request::new(SetLabelsRequest {
            nfd_version: "v0.7.0".into(),
            node_name: "ghost".into(),
            labels: BTreeMap::new(),
        });

        let status = Labeler::set_labels(&service, request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
