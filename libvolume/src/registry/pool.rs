use std::collections::HashSet;

use dashmap::{DashMap, DashSet};
use tracing::{info, warn};

use crate::error::VolumeError;
use crate::types::{NodeId, Pool, PoolId};

/// Known pools and the reachability of the nodes hosting them.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: DashMap<PoolId, Pool>,
    nodes: DashSet<NodeId>,
    unreachable: DashSet<NodeId>,
}

impl PoolRegistry {
    /// Register (or replace) a pool; its node becomes known.
    pub fn register(&self, pool: Pool) {
        info!(pool = %pool.id, node = %pool.node, capacity = pool.capacity, "pool registered");
        self.nodes.insert(pool.node.clone());
        self.pools.insert(pool.id.clone(), pool);
    }

    /// Register a node that hosts no pool (for example a nexus-only node).
    pub fn register_node(&self, node: NodeId) {
        self.nodes.insert(node);
    }

    pub fn node_known(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn get(&self, id: &PoolId) -> Option<Pool> {
        self.pools.get(id).map(|p| p.clone())
    }

    /// Pools hosted on reachable nodes.
    pub fn available(&self) -> Vec<Pool> {
        let mut pools: Vec<Pool> = self
            .pools
            .iter()
            .filter(|p| !self.unreachable.contains(&p.node))
            .map(|p| p.clone())
            .collect();
        pools.sort_by(|a, b| a.id.cmp(&b.id));
        pools
    }

    /// Reserve `size` bytes in `pool` for a new replica.
    pub fn reserve(&self, id: &PoolId, size: u64) -> Result<(), VolumeError> {
        let mut pool = self
            .pools
            .get_mut(id)
            .ok_or_else(|| VolumeError::InvalidArgument(format!("pool {id} not registered")))?;
        if pool.free() < size {
            return Err(VolumeError::NoSuitablePools { needed: 1, found: 0 });
        }
        pool.used += size;
        Ok(())
    }

    /// Give back space reserved by [`Self::reserve`].
    pub fn release(&self, id: &PoolId, size: u64) {
        match self.pools.get_mut(id) {
            Some(mut pool) => pool.used = pool.used.saturating_sub(size),
            None => warn!(pool = %id, "release on unknown pool"),
        }
    }

    /// Record whether `node` answered the last health query.
    ///
    /// Returns `true` when the reachability changed.
    pub fn set_reachable(&self, node: &NodeId, reachable: bool) -> bool {
        let changed = if reachable {
            self.unreachable.remove(node).is_some()
        } else {
            self.unreachable.insert(node.clone())
        };
        if changed {
            info!(%node, reachable, "node reachability changed");
        }
        changed
    }

    pub fn reachable(&self, node: &NodeId) -> bool {
        !self.unreachable.contains(node)
    }

    /// Nodes currently marked unreachable.
    pub fn unreachable_nodes(&self) -> HashSet<NodeId> {
        self.unreachable.iter().map(|n| n.clone()).collect()
    }
}
