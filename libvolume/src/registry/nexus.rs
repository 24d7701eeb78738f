use dashmap::DashMap;
use tracing::debug;

use crate::types::{ChildRebuild, Nexus, NexusChild, ReplicaId, VolumeId};

/// Tracks the published nexus of each volume.  A volume has at most one.
#[derive(Debug, Default)]
pub struct NexusRegistry {
    nexuses: DashMap<VolumeId, Nexus>,
}

impl NexusRegistry {
    pub fn get(&self, volume: &VolumeId) -> Option<Nexus> {
        self.nexuses.get(volume).map(|n| n.clone())
    }

    pub fn insert(&self, nexus: Nexus) {
        debug!(nexus.uuid = %nexus.uuid, volume.uuid = %nexus.volume, "nexus registered");
        self.nexuses.insert(nexus.volume, nexus);
    }

    pub fn remove(&self, volume: &VolumeId) -> Option<Nexus> {
        self.nexuses.remove(volume).map(|(_, n)| n)
    }

    /// Append a child to the volume's nexus.  No-op when unpublished.
    pub fn add_child(&self, volume: &VolumeId, child: NexusChild) {
        if let Some(mut nexus) = self.nexuses.get_mut(volume) {
            nexus.children.retain(|c| c.replica != child.replica);
            nexus.children.push(child);
        }
    }

    /// Detach the child backed by `replica`, returning it if present.
    pub fn remove_child(&self, volume: &VolumeId, replica: &ReplicaId) -> Option<NexusChild> {
        let mut nexus = self.nexuses.get_mut(volume)?;
        let index = nexus.children.iter().position(|c| &c.replica == replica)?;
        Some(nexus.children.remove(index))
    }

    /// Update the rebuild status (and optionally progress) of a child.
    pub fn set_rebuild(
        &self,
        volume: &VolumeId,
        replica: &ReplicaId,
        rebuild: ChildRebuild,
        progress: Option<u8>,
    ) {
        if let Some(mut nexus) = self.nexuses.get_mut(volume)
            && let Some(child) = nexus.children.iter_mut().find(|c| &c.replica == replica)
        {
            child.rebuild = rebuild;
            if progress.is_some() {
                child.rebuild_progress = progress;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nexuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nexuses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NexusId, Protocol};

    fn nexus(volume: VolumeId) -> Nexus {
        Nexus {
            uuid: NexusId(volume.0),
            volume,
            node: "io-engine-1".into(),
            protocol: Protocol::Nvmf,
            device_uri: "nvmf://10.0.0.1:8420/nqn".into(),
            children: vec![],
        }
    }

    fn child(replica: ReplicaId) -> NexusChild {
        NexusChild {
            replica,
            uri: format!("bdev:///{replica}"),
            rebuild: ChildRebuild::Rebuilding,
            rebuild_progress: None,
        }
    }

    #[test]
    fn child_lifecycle() {
        let registry = NexusRegistry::default();
        let volume = VolumeId::new();
        registry.insert(nexus(volume));

        let replica = ReplicaId::new();
        registry.add_child(&volume, child(replica));
        registry.add_child(&volume, child(replica));
        assert_eq!(registry.get(&volume).unwrap().children.len(), 1);

        registry.set_rebuild(&volume, &replica, ChildRebuild::Complete, Some(100));
        let n = registry.get(&volume).unwrap();
        assert_eq!(n.child(&replica).unwrap().rebuild, ChildRebuild::Complete);
        assert_eq!(n.child(&replica).unwrap().rebuild_progress, Some(100));

        assert!(registry.remove_child(&volume, &replica).is_some());
        assert!(registry.remove_child(&volume, &replica).is_none());
    }

    #[test]
    fn add_child_without_nexus_is_ignored() {
        let registry = NexusRegistry::default();
        let volume = VolumeId::new();
        registry.add_child(&volume, child(ReplicaId::new()));
        assert!(registry.get(&volume).is_none());
    }
}
