//! Kubernetes API backed stores

use super::{NodeStore, TopologyStore};
use crate::crd::NodeResourceTopology;
use crate::error::StoreError;
use crate::patch::{to_json_patch, StatusOp};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

/// Map API errors onto the store error kinds the reconcilers care about.
fn map_err(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind,
            name: name.to_string(),
        },
        e => StoreError::Api(e),
    }
}

/// Node store talking to the API server
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.api.get(name).await.map_err(|e| map_err("node", name, e))
    }

    async fn update_node(&self, node: &Node) -> Result<Node, StoreError> {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| map_err("node", &name, e))
    }

    async fn patch_status(&self, name: &str, ops: &[StatusOp]) -> Result<(), StoreError> {
        let patch = to_json_patch(ops)?;
        debug!(node = %name, ops = ops.len(), "Patching node status");
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
            .map_err(|e| map_err("node", name, e))?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Api)?;
        Ok(list.items)
    }
}

/// Topology record store talking to the API server
#[derive(Clone)]
pub struct KubeTopologyStore {
    client: Client,
}

impl KubeTopologyStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<NodeResourceTopology> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl TopologyStore for KubeTopologyStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeResourceTopology>, StoreError> {
        match self.api(namespace).get(name).await {
            Ok(nrt) => Ok(Some(nrt)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(map_err("NodeResourceTopology", name, e)),
        }
    }

    async fn create(
        &self,
        namespace: &str,
        record: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        self.api(namespace)
            .create(&PostParams::default(), record)
            .await
            .map_err(|e| map_err("NodeResourceTopology", record.name(), e))
    }

    async fn replace(
        &self,
        namespace: &str,
        record: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        self.api(namespace)
            .replace(record.name(), &PostParams::default(), record)
            .await
            .map_err(|e| map_err("NodeResourceTopology", record.name(), e))
    }
}
