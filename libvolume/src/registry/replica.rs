use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::VolumeError;
use crate::types::{Replica, ReplicaId, ReplicaState, VolumeId};

/// Tracks every replica the control plane has created, owned or orphaned.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    replicas: DashMap<ReplicaId, Replica>,
    seq: AtomicU64,
}

impl ReplicaRegistry {
    /// Record a new replica, stamping its creation sequence.
    pub fn insert(&self, mut replica: Replica) -> Replica {
        replica.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if replica.state == ReplicaState::Faulted {
            replica.faulted_at = Some(Instant::now());
        }
        debug!(replica.uuid = %replica.uuid, node = %replica.node, "replica registered");
        self.replicas.insert(replica.uuid, replica.clone());
        replica
    }

    pub fn get(&self, id: &ReplicaId) -> Result<Replica, VolumeError> {
        self.replicas
            .get(id)
            .map(|r| r.clone())
            .ok_or(VolumeError::ReplicaNotFound(*id))
    }

    pub fn remove(&self, id: &ReplicaId) -> Option<Replica> {
        self.replicas.remove(id).map(|(_, r)| r)
    }

    /// Replicas owned by `volume`, oldest first.
    pub fn by_volume(&self, volume: &VolumeId) -> Vec<Replica> {
        let mut replicas: Vec<Replica> = self
            .replicas
            .iter()
            .filter(|r| r.owner.as_ref() == Some(volume))
            .map(|r| r.clone())
            .collect();
        replicas.sort_by_key(|r| r.seq);
        replicas
    }

    /// Managed replicas without an owner, awaiting destruction.
    pub fn orphans(&self) -> Vec<Replica> {
        self.replicas
            .iter()
            .filter(|r| r.owner.is_none())
            .map(|r| r.clone())
            .collect()
    }

    /// Every owned replica.
    pub fn owned(&self) -> Vec<Replica> {
        self.replicas
            .iter()
            .filter(|r| r.owner.is_some())
            .map(|r| r.clone())
            .collect()
    }

    /// Change a replica's state; entering `Faulted` starts its grace timer.
    ///
    /// Returns the previous state.
    pub fn set_state(&self, id: &ReplicaId, state: ReplicaState) -> Result<ReplicaState, VolumeError> {
        let mut replica = self
            .replicas
            .get_mut(id)
            .ok_or(VolumeError::ReplicaNotFound(*id))?;
        let previous = replica.state;
        if previous != state {
            replica.state = state;
            replica.faulted_at = (state == ReplicaState::Faulted).then(Instant::now);
            info!(replica.uuid = %id, from = ?previous, to = ?state, "replica state changed");
        }
        Ok(previous)
    }

    /// Drop the owner of a replica, turning it into an orphan.
    pub fn disown(&self, id: &ReplicaId) {
        if let Some(mut replica) = self.replicas.get_mut(id) {
            info!(replica.uuid = %id, "replica orphaned");
            replica.owner = None;
        }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, PoolId};

    fn replica(owner: Option<VolumeId>, state: ReplicaState) -> Replica {
        Replica {
            uuid: ReplicaId::new(),
            owner,
            node: NodeId::from("node-1"),
            pool: PoolId::from("pool-1"),
            size: 1024,
            state,
            uri: "bdev:///r".into(),
            seq: 0,
            faulted_at: None,
        }
    }

    #[test]
    fn by_volume_is_ordered_by_creation() {
        let registry = ReplicaRegistry::default();
        let volume = VolumeId::new();
        let first = registry.insert(replica(Some(volume), ReplicaState::Online));
        let second = registry.insert(replica(Some(volume), ReplicaState::Online));
        registry.insert(replica(Some(VolumeId::new()), ReplicaState::Online));

        let owned = registry.by_volume(&volume);
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].uuid, first.uuid);
        assert_eq!(owned[1].uuid, second.uuid);
    }

    #[test]
    fn faulting_starts_grace_timer() {
        let registry = ReplicaRegistry::default();
        let r = registry.insert(replica(Some(VolumeId::new()), ReplicaState::Online));
        assert!(registry.get(&r.uuid).unwrap().faulted_at.is_none());

        let prev = registry.set_state(&r.uuid, ReplicaState::Faulted).unwrap();
        assert_eq!(prev, ReplicaState::Online);
        assert!(registry.get(&r.uuid).unwrap().faulted_at.is_some());
    }

    #[test]
    fn disowned_replicas_are_orphans() {
        let registry = ReplicaRegistry::default();
        let r = registry.insert(replica(Some(VolumeId::new()), ReplicaState::Online));
        assert!(registry.orphans().is_empty());
        registry.disown(&r.uuid);
        assert_eq!(registry.orphans().len(), 1);
        assert!(registry.owned().is_empty());
    }

    #[test]
    fn unknown_replica_is_not_found() {
        let registry = ReplicaRegistry::default();
        let id = ReplicaId::new();
        assert_eq!(
            registry.set_state(&id, ReplicaState::Online),
            Err(VolumeError::ReplicaNotFound(id))
        );
    }
}
