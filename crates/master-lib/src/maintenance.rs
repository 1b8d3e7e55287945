//! One-shot maintenance operations
//!
//! - [`Pruner`] removes everything the master ever published from all nodes
//! - [`advertise_master`] records the master version on the master's own node

use crate::error::{MasterError, PruneError, StoreError};
use crate::models::{annotations, Annotations, ExtendedResources, Labels};
use crate::observability::StructuredLogger;
use crate::reconcile::LabelReconciler;
use tracing::info;

/// Clears NFD labels, extended resources and annotations from every node
pub struct Pruner {
    reconciler: LabelReconciler,
    logger: StructuredLogger,
}

impl Pruner {
    pub fn new(reconciler: LabelReconciler, logger: StructuredLogger) -> Self {
        Self { reconciler, logger }
    }

    /// Prune all nodes, stopping at the first failure. Returns the number of
    /// nodes pruned.
    pub async fn prune(&self) -> Result<usize, PruneError> {
        let nodes = self
            .reconciler
            .store()
            .list_nodes()
            .await
            .map_err(PruneError::ListNodes)?;

        info!(event = "prune_started", nodes = nodes.len(), "Pruning NFD labels");

        let mut pruned = 0;
        for node in nodes {
            let Some(name) = node.metadata.name else {
                continue;
            };

            let result = self.prune_node(&name).await;
            self.logger.log_prune(&name, result.is_ok());
            result.map_err(|source| PruneError::Node {
                node: name.clone(),
                source,
            })?;
            pruned += 1;
        }

        Ok(pruned)
    }

    async fn prune_node(&self, name: &str) -> Result<(), MasterError> {
        self.reconciler
            .reconcile(
                name,
                &Labels::new(),
                &Annotations::new(),
                &ExtendedResources::new(),
            )
            .await?;
        self.reconciler.strip_annotations(name).await?;
        Ok(())
    }
}

/// Write the `master.version` annotation onto `node_name`.
pub async fn advertise_master(
    reconciler: &LabelReconciler,
    node_name: &str,
    version: &str,
) -> Result<(), StoreError> {
    let annotations = Annotations::from([(
        annotations::MASTER_VERSION.to_string(),
        version.to_string(),
    )]);
    reconciler.annotate(node_name, &annotations).await?;
    info!(node = %node_name, version = %version, "Master version advertised");
    Ok(())
}
