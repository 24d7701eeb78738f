//! Replica placement.

use std::collections::HashSet;
use std::fmt::Debug;

use crate::error::VolumeError;
use crate::types::{NodeId, Pool};

/// Picks pools for new replicas.
pub trait Placement: Send + Sync + Debug {
    /// Choose `count` pools out of `pools` for replicas of `size` bytes,
    /// avoiding nodes in `exclude`.
    fn place(
        &self,
        pools: &[Pool],
        exclude: &HashSet<NodeId>,
        size: u64,
        count: usize,
    ) -> Result<Vec<Pool>, VolumeError>;
}

/// Default policy: at most one replica per node, emptiest pool first.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpreadPlacement;

impl Placement for SpreadPlacement {
    fn place(
        &self,
        pools: &[Pool],
        exclude: &HashSet<NodeId>,
        size: u64,
        count: usize,
    ) -> Result<Vec<Pool>, VolumeError> {
        let mut candidates: Vec<&Pool> = pools
            .iter()
            .filter(|p| !exclude.contains(&p.node) && p.free() >= size)
            .collect();
        candidates.sort_by(|a, b| b.free().cmp(&a.free()).then_with(|| a.id.cmp(&b.id)));

        let mut used = HashSet::new();
        let chosen: Vec<Pool> = candidates
            .into_iter()
            .filter(|p| used.insert(p.node.clone()))
            .take(count)
            .cloned()
            .collect();

        if chosen.len() < count {
            return Err(VolumeError::NoSuitablePools {
                needed: count,
                found: chosen.len(),
            });
        }
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: &str, node: &str, free: u64) -> Pool {
        Pool {
            id: id.into(),
            node: node.into(),
            capacity: free,
            used: 0,
        }
    }

    #[test]
    fn one_replica_per_node() {
        let pools = vec![pool("p1", "a", 100), pool("p2", "a", 200), pool("p3", "b", 50)];
        let chosen = SpreadPlacement
            .place(&pools, &HashSet::new(), 10, 2)
            .unwrap();
        let ids: Vec<_> = chosen.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["p2", "p3"]);
    }

    #[test]
    fn excluded_and_full_pools_are_skipped() {
        let pools = vec![pool("p1", "a", 100), pool("p2", "b", 5), pool("p3", "c", 100)];
        let exclude = HashSet::from([NodeId::from("a")]);
        let err = SpreadPlacement.place(&pools, &exclude, 10, 2).unwrap_err();
        assert_eq!(err, VolumeError::NoSuitablePools { needed: 2, found: 1 });
    }
}
