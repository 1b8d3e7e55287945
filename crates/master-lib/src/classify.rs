//! Feature label classification
//!
//! Splits a worker's raw feature labels into publishable labels and
//! extended resources:
//! - namespaced labels are only accepted from allow-listed namespaces
//! - the bare label name must match the whitelist pattern
//! - labels configured as extended resources are moved out of the label set
//!   when their value is an integer, and dropped entirely when it is not

use crate::error::ValidationError;
use crate::models::{split_ns, ExtendedResources, Labels, LABEL_NS};
use regex::Regex;
use tracing::warn;

/// Result of classifying one feature report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Labels to publish, keyed as reported by the worker
    pub labels: Labels,
    /// Extended resources, resource name -> integer string
    pub extended_resources: ExtendedResources,
    /// Entries that were dropped
    pub rejected: Vec<ValidationError>,
}

/// Namespace and name filters applied to every feature report
#[derive(Debug, Clone)]
pub struct FeatureClassifier {
    allowed_namespaces: Vec<String>,
    name_pattern: Option<Regex>,
    extended_resource_names: Vec<String>,
}

impl FeatureClassifier {
    /// A `name_pattern` of `None` accepts every label name.
    pub fn new(
        allowed_namespaces: Vec<String>,
        name_pattern: Option<Regex>,
        extended_resource_names: Vec<String>,
    ) -> Self {
        Self {
            allowed_namespaces,
            name_pattern,
            extended_resource_names,
        }
    }

    /// Classifier that accepts every bare label and publishes no extended resources.
    pub fn permissive() -> Self {
        Self::new(Vec::new(), None, Vec::new())
    }

    pub fn allowed_namespaces(&self) -> &[String] {
        &self.allowed_namespaces
    }

    pub fn extended_resource_names(&self) -> &[String] {
        &self.extended_resource_names
    }

    /// Classify a raw label set.
    pub fn classify(&self, labels: &Labels) -> Classification {
        let mut result = Classification::default();

        for (key, value) in labels {
            let (ns, name) = split_ns(key);

            if let Some(ns) = ns {
                if !self.allowed_namespaces.iter().any(|allowed| allowed == ns) {
                    result.rejected.push(ValidationError::NamespaceNotAllowed {
                        namespace: ns.to_string(),
                        key: key.clone(),
                    });
                    continue;
                }
            }

            if let Some(pattern) = &self.name_pattern {
                if !pattern.is_match(name) {
                    result.rejected.push(ValidationError::NameNotAllowed {
                        name: name.to_string(),
                        pattern: pattern.as_str().to_string(),
                    });
                    continue;
                }
            }

            result.labels.insert(key.clone(), value.clone());
        }

        for resource in &self.extended_resource_names {
            // Keep annotations short: the default namespace is implied
            let name = strip_label_ns(resource);

            let Some(value) = result.labels.remove(name) else {
                continue;
            };

            if value.parse::<i64>().is_ok() {
                result.extended_resources.insert(name.to_string(), value);
            } else {
                result.rejected.push(ValidationError::InvalidResourceValue {
                    key: name.to_string(),
                    value,
                });
            }
        }

        for rejected in &result.rejected {
            warn!(error = %rejected, "Feature not published");
        }

        result
    }
}

fn strip_label_ns(name: &str) -> &str {
    name.strip_prefix(LABEL_NS)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(name)
}
