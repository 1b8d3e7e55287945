//! Core data models for the feature master
//!
//! Feature labels, extended resources and bookkeeping annotations are all
//! kept in `BTreeMap`s so that every key list derived from them is sorted.

use std::collections::BTreeMap;

/// Namespace for feature labels and extended resources
pub const LABEL_NS: &str = "feature.node.kubernetes.io";

/// Namespace for all NFD-related annotations
pub const ANNOTATION_NS: &str = "nfd.node.kubernetes.io";

/// Label prefixes from earlier releases, stripped on every label update
pub const LEGACY_LABEL_PREFIXES: &[&str] = &[
    "node.alpha.kubernetes-incubator.io/nfd",
    "node.alpha.kubernetes-incubator.io/node-feature-discovery",
];

/// Bookkeeping annotation names (relative to [`ANNOTATION_NS`])
pub mod annotations {
    pub const MASTER_VERSION: &str = "master.version";
    pub const WORKER_VERSION: &str = "worker.version";
    pub const FEATURE_LABELS: &str = "feature-labels";
    pub const EXTENDED_RESOURCES: &str = "extended-resources";
}

/// Labels are a Kubernetes representation of discovered features.
pub type Labels = BTreeMap<String, String>;

/// Extended resources created from discovered features, name -> integer string.
pub type ExtendedResources = BTreeMap<String, String>;

/// NFD-related node metadata, keyed without the annotation namespace.
pub type Annotations = BTreeMap<String, String>;

/// A single reporting cycle of one worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureReport {
    pub node_name: String,
    pub agent_version: String,
    pub labels: Labels,
}

/// Split a key into `(namespace, name)`. The namespace is `None` for bare keys.
pub fn split_ns(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// Prefix `key` with `ns` unless it already carries a namespace.
pub fn add_ns(key: &str, ns: &str) -> String {
    if key.contains('/') {
        key.to_string()
    } else {
        format!("{}/{}", ns, key)
    }
}

/// Qualify a bare label or resource name with [`LABEL_NS`].
pub fn qualify_label(key: &str) -> String {
    add_ns(key, LABEL_NS)
}

/// Full annotation key; annotations are never treated as pre-namespaced.
pub fn annotation_key(name: &str) -> String {
    format!("{}/{}", ANNOTATION_NS, name)
}

/// Parse a comma-joined bookkeeping annotation value, skipping empty entries.
pub fn parse_key_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join keys into the bookkeeping format (sorted, comma separated).
pub fn join_key_list<'a>(keys: impl IntoIterator<Item = &'a String>) -> String {
    let mut keys: Vec<&str> = keys.into_iter().map(String::as_str).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ns() {
        assert_eq!(split_ns("cpu-model"), (None, "cpu-model"));
        assert_eq!(split_ns("vendor.io/gpu"), (Some("vendor.io"), "gpu"));
        assert_eq!(split_ns("a/b/c"), (Some("a"), "b/c"));
    }

    #[test]
    fn test_add_ns_keeps_existing_namespace() {
        assert_eq!(qualify_label("gpu"), "feature.node.kubernetes.io/gpu");
        assert_eq!(qualify_label("vendor.io/gpu"), "vendor.io/gpu");
    }

    #[test]
    fn test_annotation_key_always_qualifies() {
        assert_eq!(
            annotation_key("feature-labels"),
            "nfd.node.kubernetes.io/feature-labels"
        );
        assert_eq!(annotation_key("x/y"), "nfd.node.kubernetes.io/x/y");
    }

    #[test]
    fn test_key_list_roundtrip_skips_empty() {
        assert!(parse_key_list("").is_empty());
        assert_eq!(parse_key_list("a,,b"), vec!["a", "b"]);

        let keys = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(join_key_list(&keys), "a,b");
    }
}
