//! Object store capabilities consumed by the reconcilers
//!
//! The reconcilers only ever talk to the cluster through these traits:
//! - [`NodeStore`] for node objects and their status
//! - [`TopologyStore`] for the per-node topology records
//!
//! [`cluster`] holds the implementations backed by the Kubernetes API and
//! [`memory`] an in-process store used by tests and dry runs.

pub mod cluster;
pub mod memory;

use crate::crd::NodeResourceTopology;
use crate::error::StoreError;
use crate::patch::StatusOp;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

pub use cluster::{KubeNodeStore, KubeTopologyStore};
pub use memory::{InMemoryNodeStore, InMemoryTopologyStore};

/// Access to node objects
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch the current node object.
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;

    /// Replace the node object. Labels and annotations are written atomically.
    async fn update_node(&self, node: &Node) -> Result<Node, StoreError>;

    /// Apply a batch of operations to the node's status as one patch.
    async fn patch_status(&self, name: &str, ops: &[StatusOp]) -> Result<(), StoreError>;

    /// List all nodes of the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
}

/// Access to NodeResourceTopology objects
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Fetch a record, `None` if it does not exist.
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeResourceTopology>, StoreError>;

    async fn create(
        &self,
        namespace: &str,
        record: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError>;

    async fn replace(
        &self,
        namespace: &str,
        record: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError>;
}
