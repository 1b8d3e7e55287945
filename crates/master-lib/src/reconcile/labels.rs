//! Node label, annotation and extended resource reconciliation
//!
//! The bookkeeping annotations written together with the labels are the
//! only record of what was published last time. Each update:
//! 1. fetches the node and diffs extended resources against its status
//! 2. removes the previously published labels that are gone, strips legacy
//!    labels and writes the new ones
//! 3. writes the annotations and replaces the node object
//! 4. applies the status patch, if any
//!
//! Steps 3 and 4 are separate API calls. When the patch fails the labels
//! stay committed and the error is returned. The next report converges
//! since status operations are always computed against the node's actual
//! capacity.

use super::resources::extended_resource_ops;
use crate::error::{MasterError, StoreError};
use crate::locks::NodeLocks;
use crate::models::{
    annotation_key, annotations, parse_key_list, qualify_label, Annotations, ExtendedResources,
    Labels, ANNOTATION_NS, LEGACY_LABEL_PREFIXES,
};
use crate::patch::StatusOp;
use crate::store::NodeStore;
use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Set difference between the previously published label keys and a new label set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
    /// Qualified keys published before and absent now
    pub remove: Vec<String>,
    /// Qualified keys and values to write
    pub upsert: BTreeMap<String, String>,
}

impl LabelDiff {
    /// Diff `previous` keys (as listed in the bookkeeping annotation) against `labels`.
    pub fn compute<'a>(previous: impl IntoIterator<Item = &'a str>, labels: &Labels) -> Self {
        let upsert: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (qualify_label(k), v.clone()))
            .collect();

        let remove: BTreeSet<String> = previous
            .into_iter()
            .map(qualify_label)
            .filter(|k| !upsert.contains_key(k))
            .collect();

        Self {
            remove: remove.into_iter().collect(),
            upsert,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.upsert.is_empty()
    }

    /// Apply the diff to a label map, also dropping every legacy label.
    pub fn apply(&self, labels: &mut BTreeMap<String, String>) {
        for key in &self.remove {
            labels.remove(key);
        }
        labels.retain(|key, _| {
            !LEGACY_LABEL_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        });
        for (key, value) in &self.upsert {
            labels.insert(key.clone(), value.clone());
        }
    }
}

/// Label keys published by the previous report.
pub fn previous_labels(node: &Node) -> Vec<String> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&annotation_key(annotations::FEATURE_LABELS)))
        .map(|v| parse_key_list(v))
        .unwrap_or_default()
}

/// Write annotations under the NFD annotation namespace.
pub fn add_annotations(node: &mut Node, new: &Annotations) {
    let map = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in new {
        map.insert(annotation_key(key), value.clone());
    }
}

/// Outcome of one label reconciliation
#[derive(Debug, Clone, Default)]
pub struct LabelUpdate {
    pub diff: LabelDiff,
    pub status_ops: Vec<StatusOp>,
}

/// Brings node labels, annotations and extended resources up to date
#[derive(Clone)]
pub struct LabelReconciler {
    store: Arc<dyn NodeStore>,
    locks: NodeLocks,
}

impl LabelReconciler {
    pub fn new(store: Arc<dyn NodeStore>, locks: NodeLocks) -> Self {
        Self { store, locks }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Reconcile `node_name` with a freshly classified feature set.
    pub async fn reconcile(
        &self,
        node_name: &str,
        labels: &Labels,
        annotations: &Annotations,
        extended_resources: &ExtendedResources,
    ) -> Result<LabelUpdate, MasterError> {
        let _guard = self.locks.lock(node_name).await;

        let mut node = self.store.get_node(node_name).await.map_err(|e| {
            warn!(node = %node_name, error = %e, "Failed to get node");
            e
        })?;

        // Resolve status ops before the node is modified
        let status_ops = extended_resource_ops(&node, extended_resources);

        let previous = previous_labels(&node);
        let diff = LabelDiff::compute(previous.iter().map(String::as_str), labels);
        diff.apply(node.metadata.labels.get_or_insert_with(BTreeMap::new));
        add_annotations(&mut node, annotations);

        self.store.update_node(&node).await.map_err(|e| {
            warn!(node = %node_name, error = %e, "Can't update node");
            e
        })?;

        debug!(
            node = %node_name,
            removed = ?diff.remove,
            labels = diff.upsert.len(),
            "Node labels updated"
        );

        if !status_ops.is_empty() {
            self.store
                .patch_status(node_name, &status_ops)
                .await
                .map_err(|source| {
                    warn!(
                        node = %node_name,
                        error = %source,
                        "Error while patching extended resources"
                    );
                    MasterError::StatusPatch {
                        node: node_name.to_string(),
                        source,
                    }
                })?;
            info!(
                node = %node_name,
                ops = status_ops.len(),
                "Extended resources patched"
            );
        }

        Ok(LabelUpdate { diff, status_ops })
    }

    /// Write a set of annotations onto a node without touching its labels.
    pub async fn annotate(&self, node_name: &str, annotations: &Annotations) -> Result<(), StoreError> {
        let _guard = self.locks.lock(node_name).await;

        let mut node = self.store.get_node(node_name).await?;
        add_annotations(&mut node, annotations);
        self.store.update_node(&node).await?;
        Ok(())
    }

    /// Remove every annotation under the NFD annotation namespace.
    pub async fn strip_annotations(&self, node_name: &str) -> Result<usize, StoreError> {
        let _guard = self.locks.lock(node_name).await;

        let mut node = self.store.get_node(node_name).await?;
        let prefix = format!("{}/", ANNOTATION_NS);
        let map = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
        let before = map.len();
        map.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - map.len();

        self.store.update_node(&node).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LABEL_NS;
    use crate::patch::{PatchVerb, StatusField};
    use crate::store::memory::{new_node, InMemoryNodeStore};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn bookkeeping(labels: &Labels, resources: &ExtendedResources) -> Annotations {
        let qualified: Vec<String> = labels.keys().map(|k| qualify_label(k)).collect();
        map(&[
            ("worker.version", "v0.7.0"),
            (
                "feature-labels",
                &crate::models::join_key_list(&qualified),
            ),
            (
                "extended-resources",
                &crate::models::join_key_list(resources.keys()),
            ),
        ])
    }

    fn setup() -> (Arc<InMemoryNodeStore>, LabelReconciler) {
        let store = Arc::new(InMemoryNodeStore::with_nodes(["n1"]));
        let reconciler = LabelReconciler::new(store.clone(), NodeLocks::new());
        (store, reconciler)
    }

    async fn run(
        reconciler: &LabelReconciler,
        labels: &Labels,
        resources: &ExtendedResources,
    ) -> Result<LabelUpdate, MasterError> {
        reconciler
            .reconcile("n1", labels, &bookkeeping(labels, resources), resources)
            .await
    }

    #[test]
    fn test_diff_removes_stale_keys_only() {
        let diff = LabelDiff::compute(["a", "b"], &map(&[("b", "2")]));

        assert_eq!(diff.remove, vec![format!("{}/a", LABEL_NS)]);
        assert_eq!(diff.upsert, map(&[("feature.node.kubernetes.io/b", "2")]));
    }

    #[test]
    fn test_diff_accepts_qualified_previous_keys() {
        let diff = LabelDiff::compute(
            ["feature.node.kubernetes.io/a", "vendor.io/x"],
            &map(&[("a", "1")]),
        );
        assert_eq!(diff.remove, vec!["vendor.io/x".to_string()]);
    }

    #[test]
    fn test_apply_strips_legacy_labels() {
        let mut labels = map(&[
            ("node.alpha.kubernetes-incubator.io/nfd-cpu", "true"),
            ("node.alpha.kubernetes-incubator.io/node-feature-discovery.version", "v0.1"),
            ("kubernetes.io/hostname", "n1"),
        ]);
        LabelDiff::default().apply(&mut labels);
        assert_eq!(labels, map(&[("kubernetes.io/hostname", "n1")]));
    }

    #[tokio::test]
    async fn test_stale_label_is_removed() {
        let (store, reconciler) = setup();
        run(&reconciler, &map(&[("a", "1"), ("b", "1")]), &map(&[]))
            .await
            .unwrap();
        run(&reconciler, &map(&[("b", "2")]), &map(&[])).await.unwrap();

        let labels = store.node("n1").unwrap().metadata.labels.unwrap();
        assert!(!labels.contains_key("feature.node.kubernetes.io/a"));
        assert_eq!(labels["feature.node.kubernetes.io/b"], "2");
    }

    #[tokio::test]
    async fn test_foreign_labels_survive() {
        let (store, reconciler) = setup();
        let mut node = store.node("n1").unwrap();
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("kubernetes.io/hostname".into(), "n1".into());
        store.insert(node);

        run(&reconciler, &map(&[("a", "1")]), &map(&[])).await.unwrap();
        run(&reconciler, &map(&[]), &map(&[])).await.unwrap();

        let labels = store.node("n1").unwrap().metadata.labels.unwrap();
        assert_eq!(labels, map(&[("kubernetes.io/hostname", "n1")]));
    }

    #[tokio::test]
    async fn test_second_identical_pass_emits_no_status_ops() {
        let (store, reconciler) = setup();
        let labels = map(&[("cpu-model", "xeon")]);
        let resources = map(&[("gpu", "2")]);

        let first = run(&reconciler, &labels, &resources).await.unwrap();
        assert_eq!(first.status_ops.len(), 1);

        let second = run(&reconciler, &labels, &resources).await.unwrap();
        assert!(second.status_ops.is_empty());
        assert_eq!(store.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_resource_round_trip() {
        let (store, reconciler) = setup();
        let key = "feature.node.kubernetes.io/gpu";

        run(&reconciler, &map(&[]), &map(&[("gpu", "2")])).await.unwrap();
        let capacity = store.node("n1").unwrap().status.unwrap().capacity.unwrap();
        assert_eq!(capacity[key], Quantity("2".into()));

        let update = run(&reconciler, &map(&[]), &map(&[])).await.unwrap();
        assert_eq!(
            update.status_ops,
            vec![
                StatusOp::remove("gpu", StatusField::Capacity),
                StatusOp::remove("gpu", StatusField::Allocatable),
            ]
        );
        let status = store.node("n1").unwrap().status.unwrap();
        assert!(!status.capacity.unwrap().contains_key(key));
        assert!(!status.allocatable.unwrap().contains_key(key));
    }

    #[tokio::test]
    async fn test_changed_resource_value_is_replaced() {
        let (store, reconciler) = setup();
        run(&reconciler, &map(&[]), &map(&[("gpu", "2")])).await.unwrap();
        let update = run(&reconciler, &map(&[]), &map(&[("gpu", "8")]))
            .await
            .unwrap();

        assert!(update.status_ops.iter().all(|op| op.op == PatchVerb::Replace));
        let status = store.node("n1").unwrap().status.unwrap();
        assert_eq!(
            status.allocatable.unwrap()["feature.node.kubernetes.io/gpu"],
            Quantity("8".into())
        );
    }

    #[tokio::test]
    async fn test_annotations_are_namespaced() {
        let (store, reconciler) = setup();
        run(&reconciler, &map(&[("cpu-model", "xeon")]), &map(&[]))
            .await
            .unwrap();

        let annotations = store.node("n1").unwrap().metadata.annotations.unwrap();
        assert_eq!(
            annotations["nfd.node.kubernetes.io/feature-labels"],
            "feature.node.kubernetes.io/cpu-model"
        );
        assert_eq!(annotations["nfd.node.kubernetes.io/worker.version"], "v0.7.0");
    }

    #[tokio::test]
    async fn test_missing_node_aborts_without_mutation() {
        let (store, reconciler) = setup();
        let err = reconciler
            .reconcile("ghost", &map(&[("a", "1")]), &map(&[]), &map(&[]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MasterError::Store(StoreError::NotFound { .. })
        ));
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_patch_failure_keeps_labels_committed() {
        let (store, reconciler) = setup();
        store.fail_next_patch();

        let err = run(&reconciler, &map(&[("a", "1")]), &map(&[("gpu", "2")]))
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::StatusPatch { .. }));

        let node = store.node("n1").unwrap();
        assert_eq!(
            node.metadata.labels.unwrap()["feature.node.kubernetes.io/a"],
            "1"
        );
        assert!(node.status.unwrap().capacity.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_annotate_leaves_labels() {
        let (store, reconciler) = setup();
        run(&reconciler, &map(&[("a", "1")]), &map(&[])).await.unwrap();
        reconciler
            .annotate("n1", &map(&[("master.version", "v0.7.0")]))
            .await
            .unwrap();

        let node = store.node("n1").unwrap();
        assert_eq!(node.metadata.labels.unwrap().len(), 1);
        assert_eq!(
            node.metadata.annotations.unwrap()["nfd.node.kubernetes.io/master.version"],
            "v0.7.0"
        );
    }

    #[tokio::test]
    async fn test_strip_annotations_keeps_foreign_keys() {
        let (store, reconciler) = setup();
        run(&reconciler, &map(&[("a", "1")]), &map(&[])).await.unwrap();
        let mut node = store.node("n1").unwrap();
        node.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("node.alpha.kubernetes.io/ttl".into(), "0".into());
        store.insert(node);

        let removed = reconciler.strip_annotations("n1").await.unwrap();

        assert_eq!(removed, 3);
        let annotations = store.node("n1").unwrap().metadata.annotations.unwrap();
        assert_eq!(annotations, map(&[("node.alpha.kubernetes.io/ttl", "0")]));
    }

    #[test]
    fn test_previous_labels_without_annotation() {
        assert!(previous_labels(&new_node("n1")).is_empty());
    }
}
