//! Placement policy.
//!
//! Replicas go to the least-loaded live node that does not already hold a
//! copy of the shard; ties break by node name so repeated runs over the
//! same cluster state produce the same placement.

use std::collections::{HashMap, HashSet};

/// Effective replica count for one shard: the configured level, clamped
/// to the number of live nodes.
pub fn replication_target(replication_level: u32, live_nodes: usize) -> usize {
    (replication_level as usize).min(live_nodes)
}

/// Pick the next node for a replica. `loads` holds current assignment
/// counts for every live node; `exclude` holds nodes that already carry
/// the shard (or failed it).
pub fn pick_least_loaded(
    loads: &HashMap<String, usize>,
    exclude: &HashSet<String>,
) -> Option<String> {
    loads
        .iter()
        .filter(|(node, _)| !exclude.contains(*node))
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(node, _)| node.clone())
}
