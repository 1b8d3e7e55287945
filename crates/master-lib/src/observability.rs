//! Observability infrastructure for the master
//!
//! Provides:
//! - Prometheus metrics (request outcomes, reconcile latency, rejected features)
//! - Structured JSON logging with tracing

use crate::error::ValidationError;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// RPC operation names used as metric labels
pub mod operations {
    pub const SET_LABELS: &str = "set_labels";
    pub const UPDATE_TOPOLOGY: &str = "update_node_topology";
}

/// Master metrics for Prometheus exposition
///
/// Cloning is cheap; clones share the same underlying metrics and registry.
#[derive(Clone)]
pub struct MasterMetrics {
    registry: Registry,
    requests: IntCounterVec,
    reconcile_latency_seconds: HistogramVec,
    rejected_features: IntCounterVec,
    status_ops: IntCounter,
}

impl MasterMetrics {
    /// Create metrics registered in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`.
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "nfd_master_requests_total",
                "Number of worker requests by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        let reconcile_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "nfd_master_reconcile_latency_seconds",
                "Time spent handling a worker request",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )?;
        let rejected_features = IntCounterVec::new(
            Opts::new(
                "nfd_master_rejected_features_total",
                "Feature labels dropped during classification",
            ),
            &["reason"],
        )?;
        let status_ops = IntCounter::new(
            "nfd_master_status_ops_total",
            "Extended resource operations patched into node status",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(reconcile_latency_seconds.clone()))?;
        registry.register(Box::new(rejected_features.clone()))?;
        registry.register(Box::new(status_ops.clone()))?;

        Ok(Self {
            registry,
            requests,
            reconcile_latency_seconds,
            rejected_features,
            status_ops,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome and latency of one request
    pub fn observe_request(&self, operation: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "error" };
        self.requests
            .with_label_values(&[operation, outcome])
            .inc();
        self.reconcile_latency_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    /// Count features dropped by the classifier
    pub fn inc_rejected(&self, rejected: &[ValidationError]) {
        for err in rejected {
            let reason = match err {
                ValidationError::NamespaceNotAllowed { .. } => "namespace",
                ValidationError::NameNotAllowed { .. } => "name",
                ValidationError::InvalidResourceValue { .. } => "resource_value",
            };
            self.rejected_features.with_label_values(&[reason]).inc();
        }
    }

    pub fn add_status_ops(&self, count: usize) {
        self.status_ops.inc_by(count as u64);
    }

    pub fn request_count(&self, operation: &str, success: bool) -> u64 {
        let outcome = if success { "success" } else { "error" };
        self.requests.with_label_values(&[operation, outcome]).get()
    }
}

/// Structured logger for master events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log master startup
    pub fn log_startup(&self, version: &str, port: u16, publish: bool) {
        info!(
            event = "master_started",
            node = %self.node_name,
            version = %version,
            port = port,
            publish = publish,
            "Node Feature Discovery master started"
        );
    }

    /// Log master shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "master_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Node Feature Discovery master shutting down"
        );
    }

    /// Log a pruned node
    pub fn log_prune(&self, target: &str, success: bool) {
        if success {
            info!(event = "node_pruned", node = %target, "Pruned NFD labels and annotations");
        } else {
            warn!(event = "node_prune_failed", node = %target, "Failed to prune node");
        }
    }
}
