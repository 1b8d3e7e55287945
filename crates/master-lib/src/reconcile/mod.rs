//! Cluster-state reconciliation for worker reports

pub mod labels;
pub mod resources;
pub mod topology;

pub use labels::{LabelDiff, LabelReconciler, LabelUpdate};
pub use resources::extended_resource_ops;
pub use topology::{TopologyOutcome, TopologyReconciler};
