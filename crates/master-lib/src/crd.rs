//! NodeResourceTopology custom resource
//!
//! One object per node, named after the node. Unlike most custom resources
//! the payload lives at the top level of the object (`topologyPolicies`,
//! `zones`) rather than under `spec`, so the `kube::Resource` impl is
//! written by hand instead of derived.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::core::TypeMeta;
use kube::Resource;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub const GROUP: &str = "topology.node.k8s.io";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "NodeResourceTopology";
pub const PLURAL: &str = "noderesourcetopologies";

/// Capacity and allocatable amount of one resource within a zone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub capacity: i64,
    pub allocatable: i64,
}

/// A topology locality unit such as a NUMA node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(rename = "type")]
    pub zone_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub costs: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceInfo>,
}

pub type ZoneMap = BTreeMap<String, Zone>;

/// Per-node resource topology record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceTopology {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub topology_policies: Vec<String>,
    #[serde(default)]
    pub zones: ZoneMap,
}

impl NodeResourceTopology {
    /// New record for `node_name` in `namespace`.
    pub fn new(node_name: &str, namespace: &str, policies: Vec<String>, zones: ZoneMap) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{}/{}", GROUP, VERSION),
                kind: KIND.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(node_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            topology_policies: policies,
            zones,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

impl Resource for NodeResourceTopology {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(PLURAL)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
