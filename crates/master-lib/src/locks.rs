//! Per-node mutual exclusion
//!
//! Reports for the same node are serialized around their
//! fetch-mutate-replace sequence; reports for different nodes proceed in
//! parallel. This only orders writers inside one master process, writers
//! elsewhere still show up as update conflicts.
//!
//! An entry lives only while someone holds or waits for it, so the table
//! stays as large as the number of nodes currently being reconciled. A
//! waiter cancelled before acquiring leaves its entry in place until that
//! node is locked again.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of per-node locks
#[derive(Debug, Clone, Default)]
pub struct NodeLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `node_name`.
    pub async fn lock(&self, node_name: &str) -> NodeGuard {
        let lock = self
            .locks
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        NodeGuard {
            guard: Some(lock.lock_owned().await),
            node_name: node_name.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of nodes locked or waited for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one node; the table entry is dropped with the last user.
#[derive(Debug)]
pub struct NodeGuard {
    guard: Option<OwnedMutexGuard<()>>,
    node_name: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means the map's.
        self.locks
            .remove_if(&self.node_name, |_, lock| Arc::strong_count(lock) == 1);
    }
}
