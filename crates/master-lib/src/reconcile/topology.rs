//! NodeResourceTopology reconciliation
//!
//! The zone set of a node's record is replaced wholesale on every report;
//! individual zones are never merged.

use crate::crd::{NodeResourceTopology, ResourceInfo, Zone, ZoneMap};
use crate::error::MasterError;
use crate::locks::NodeLocks;
use crate::proto::topology;
use crate::store::TopologyStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Convert reported zones into the record's zone shape.
pub fn convert_zones(zones: &BTreeMap<String, topology::Zone>) -> ZoneMap {
    zones
        .iter()
        .map(|(name, zone)| {
            let resources = zone
                .resources
                .iter()
                .map(|(res, info)| {
                    (
                        res.clone(),
                        ResourceInfo {
                            capacity: info.capacity,
                            allocatable: info.allocatable,
                        },
                    )
                })
                .collect();
            let costs = zone
                .costs
                .iter()
                .map(|(peer, cost)| (peer.clone(), i64::from(*cost)))
                .collect();

            (
                name.clone(),
                Zone {
                    zone_type: zone.r#type.clone(),
                    parent: zone.parent.clone(),
                    costs,
                    resources,
                },
            )
        })
        .collect()
}

/// Whether a reconcile created a record or updated an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyOutcome {
    Created,
    Updated,
}

/// Upserts the per-node topology record
#[derive(Clone)]
pub struct TopologyReconciler {
    store: Arc<dyn TopologyStore>,
    locks: NodeLocks,
}

impl TopologyReconciler {
    pub fn new(store: Arc<dyn TopologyStore>, locks: NodeLocks) -> Self {
        Self { store, locks }
    }

    pub async fn reconcile(
        &self,
        node_name: &str,
        topology_policies: &[String],
        zones: &BTreeMap<String, topology::Zone>,
        namespace: &str,
    ) -> Result<TopologyOutcome, MasterError> {
        let zones = convert_zones(zones);
        debug!(node = %node_name, zones = zones.len(), "Updating node topology");

        let _guard = self.locks.lock(node_name).await;

        let existing = self.store.get(namespace, node_name).await.map_err(|e| {
            warn!(node = %node_name, namespace = %namespace, error = %e, "Failed to get NodeResourceTopology");
            e
        })?;

        match existing {
            None => {
                let record = NodeResourceTopology::new(
                    node_name,
                    namespace,
                    topology_policies.to_vec(),
                    zones,
                );
                self.store.create(namespace, &record).await.map_err(|e| {
                    warn!(node = %node_name, error = %e, "Failed to create NodeResourceTopology");
                    e
                })?;
                info!(node = %node_name, namespace = %namespace, "NodeResourceTopology created");
                Ok(TopologyOutcome::Created)
            }
            Some(current) => {
                let mut updated = current.clone();
                updated.zones = zones;
                self.store.replace(namespace, &updated).await.map_err(|e| {
                    warn!(node = %node_name, error = %e, "Failed to update NodeResourceTopology");
                    e
                })?;
                info!(node = %node_name, namespace = %namespace, "NodeResourceTopology updated");
                Ok(TopologyOutcome::Updated)
            }
        }
    }
}
