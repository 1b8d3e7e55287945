//! In-process object stores
//!
//! Behaves like the API server where the reconcilers can observe it:
//! - every update bumps `metadata.resourceVersion` and rejects stale writes
//! - adding a capacity entry implicitly adds the matching allocatable entry
//! - status patches are all-or-nothing
//!
//! Every mutation is recorded so tests can assert on what was sent.

use super::{NodeStore, TopologyStore};
use crate::crd::NodeResourceTopology;
use crate::error::StoreError;
use crate::patch::{PatchVerb, StatusField, StatusOp};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Build a bare node object with empty label and annotation maps.
pub fn new_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::new()),
            annotations: Some(BTreeMap::new()),
            ..ObjectMeta::default()
        },
        status: Some(NodeStatus::default()),
        ..Node::default()
    }
}

fn bump_version(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

/// In-memory node store
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    updates: AtomicUsize,
    patches: Mutex<Vec<Vec<StatusOp>>>,
    fail_patch: AtomicBool,
    unavailable: AtomicBool,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with empty nodes of the given names.
    pub fn with_nodes<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let store = Self::new();
        for name in names {
            store.insert(new_node(name));
        }
        store
    }

    /// Insert or overwrite a node, bypassing version checks.
    pub fn insert(&self, mut node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        bump_version(&mut node.metadata);
        self.lock_nodes().insert(name, node);
    }

    /// Snapshot of a stored node.
    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock_nodes().get(name).cloned()
    }

    /// Number of successful node updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Every status patch batch received, in order.
    pub fn patches(&self) -> Vec<Vec<StatusOp>> {
        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make the next status patch fail.
    pub fn fail_next_patch(&self) {
        self.fail_patch.store(true, Ordering::SeqCst);
    }

    /// Make every call fail as if the API server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.check_available()?;
        self.lock_nodes()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "node",
                name: name.to_string(),
            })
    }

    async fn update_node(&self, node: &Node) -> Result<Node, StoreError> {
        self.check_available()?;
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut nodes = self.lock_nodes();

        let current = nodes.get(&name).ok_or_else(|| StoreError::NotFound {
            kind: "node",
            name: name.clone(),
        })?;
        if node.metadata.resource_version.is_some()
            && node.metadata.resource_version != current.metadata.resource_version
        {
            return Err(StoreError::Conflict { kind: "node", name });
        }

        // Status is a subresource, object updates never touch it
        let mut updated = node.clone();
        updated.status = current.status.clone();
        bump_version(&mut updated.metadata);
        nodes.insert(name, updated.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn patch_status(&self, name: &str, ops: &[StatusOp]) -> Result<(), StoreError> {
        self.check_available()?;
        if self.fail_patch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected patch failure".into()));
        }

        let mut nodes = self.lock_nodes();
        let node = nodes.get_mut(name).ok_or_else(|| StoreError::NotFound {
            kind: "node",
            name: name.to_string(),
        })?;

        let mut status = node.status.clone().unwrap_or_default();
        for op in ops {
            apply_op(&mut status, op)?;
        }
        node.status = Some(status);
        bump_version(&mut node.metadata);

        self.patches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ops.to_vec());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.check_available()?;
        Ok(self.lock_nodes().values().cloned().collect())
    }
}

fn apply_op(status: &mut NodeStatus, op: &StatusOp) -> Result<(), StoreError> {
    let (field, resource) = op.target()?;
    let missing_value = || StoreError::InvalidPatch(format!("{} without value", op.path));

    match op.op {
        PatchVerb::Add => {
            let value = op.value.clone().ok_or_else(missing_value)?;
            if field == StatusField::Capacity {
                status
                    .allocatable
                    .get_or_insert_with(BTreeMap::new)
                    .entry(resource.clone())
                    .or_insert_with(|| Quantity(value.clone()));
            }
            field_map(status, field).insert(resource, Quantity(value));
        }
        PatchVerb::Replace => {
            let value = op.value.clone().ok_or_else(missing_value)?;
            let entry = field_map(status, field)
                .get_mut(&resource)
                .ok_or_else(|| StoreError::InvalidPatch(format!("{} does not exist", op.path)))?;
            *entry = Quantity(value);
        }
        PatchVerb::Remove => {
            field_map(status, field)
                .remove(&resource)
                .ok_or_else(|| StoreError::InvalidPatch(format!("{} does not exist", op.path)))?;
        }
    }
    Ok(())
}

fn field_map(status: &mut NodeStatus, field: StatusField) -> &mut BTreeMap<String, Quantity> {
    match field {
        StatusField::Capacity => status.capacity.get_or_insert_with(BTreeMap::new),
        StatusField::Allocatable => status.allocatable.get_or_insert_with(BTreeMap::new),
    }
}

/// In-memory NodeResourceTopology store
#[derive(Debug, Default)]
pub struct InMemoryTopologyStore {
    records: Mutex<BTreeMap<(String, String), NodeResourceTopology>>,
    creates: AtomicUsize,
    replaces: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, namespace: &str, name: &str) -> Option<NodeResourceTopology> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Insert a record directly.
    pub fn insert(&self, namespace: &str, record: NodeResourceTopology) {
        self.lock()
            .insert((namespace.to_string(), record.name().to_string()), record);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn replace_count(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), NodeResourceTopology>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TopologyStore for InMemoryTopologyStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeResourceTopology>, StoreError> {
        self.check_available()?;
        Ok(self.record(namespace, name))
    }

    async fn create(
        &self,
        namespace: &str,
        record: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        self.check_available()?;
        let key = (namespace.to_string(), record.name().to_string());
        let mut records = self.lock();
        if records.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: "NodeResourceTopology",
                name: key.1,
            });
        }

        let mut created = record.clone();
        created.metadata.namespace = Some(namespace.to_string());
        bump_version(&mut created.metadata);
        records.insert(key, created.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(
        &self,
        namespace: &str,
        record: &NodeResourceTopology,
    ) -> Result<NodeResourceTopology, StoreError> {
        self.check_available()?;
        let key = (namespace.to_string(), record.name().to_string());
        let mut records = self.lock();
        let current = records.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: "NodeResourceTopology",
            name: key.1.clone(),
        })?;
        if record.metadata.resource_version.is_some()
            && record.metadata.resource_version != current.metadata.resource_version
        {
            return Err(StoreError::Conflict {
                kind: "NodeResourceTopology",
                name: key.1,
            });
        }

        let mut updated = record.clone();
        bump_version(&mut updated.metadata);
        records.insert(key, updated.clone());
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}
