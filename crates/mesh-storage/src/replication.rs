//! Replica bookkeeping: which nodes should hold each path, which are
//! confirmed to.
//!
//! Health of a path is `confirmed / targets`. An empty target set has health
//! 0.0 so the file is re-distributed once nodes appear.

use std::collections::{BTreeSet, HashMap};

use mesh_core::NodeId;

#[derive(Debug, Clone, Default)]
struct ReplicaSet {
    targets: BTreeSet<NodeId>,
    confirmed: BTreeSet<NodeId>,
}

impl ReplicaSet {
    fn health(&self) -> f64 {
        if self.targets.is_empty() {
            return 0.0;
        }
        self.confirmed.len() as f64 / self.targets.len() as f64
    }
}

#[derive(Debug, Default)]
pub struct ReplicationTracker {
    files: HashMap<String, ReplicaSet>,
}

impl ReplicationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the target set for `path`, replacing any earlier record.
    pub fn track_replication(&mut self, path: &str, targets: impl IntoIterator<Item = NodeId>) {
        self.files.insert(
            path.to_string(),
            ReplicaSet {
                targets: targets.into_iter().collect(),
                confirmed: BTreeSet::new(),
            },
        );
    }

    /// Mark `node` as holding a replica. Nodes outside the target set are ignored.
    pub fn confirm_replica(&mut self, path: &str, node: &str) -> bool {
        match self.files.get_mut(path) {
            Some(set) if set.targets.contains(node) => set.confirmed.insert(node.to_string()),
            _ => false,
        }
    }

    pub fn revoke_replica(&mut self, path: &str, node: &str) -> bool {
        self.files
            .get_mut(path)
            .is_some_and(|set| set.confirmed.remove(node))
    }

    /// Forget `path`, returning the nodes that held confirmed replicas.
    pub fn untrack(&mut self, path: &str) -> Vec<NodeId> {
        self.files
            .remove(path)
            .map(|set| set.confirmed.into_iter().collect())
            .unwrap_or_default()
    }

    /// Fraction of targets confirmed for `path`; `None` when untracked.
    pub fn get_file_health(&self, path: &str) -> Option<f64> {
        self.files.get(path).map(ReplicaSet::health)
    }

    /// Mean health across tracked paths; 1.0 when nothing is tracked.
    pub fn get_overall_health(&self) -> f64 {
        if self.files.is_empty() {
            return 1.0;
        }
        let sum: f64 = self.files.values().map(ReplicaSet::health).sum();
        sum / self.files.len() as f64
    }

    pub fn needs_replication(&self, path: &str, threshold: f64) -> bool {
        self.get_file_health(path).is_some_and(|h| h < threshold)
    }

    /// Tracked paths whose health is below `threshold`, sorted.
    pub fn paths_below(&self, threshold: f64) -> Vec<String> {
        let mut paths: Vec<String> = self
            .files
            .iter()
            .filter(|(_, set)| set.health() < threshold)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn confirmed_nodes(&self, path: &str) -> Vec<NodeId> {
        self.files
            .get(path)
            .map(|set| set.confirmed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
