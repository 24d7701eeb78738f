//! In-memory staging and publish tables of the node plugin.
//!
//! Both tables keep a forward map and a reverse index so the uniqueness
//! rules can be checked from either side:
//!
//! * a staging path holds at most one volume, a volume is staged at most once;
//! * a target path holds at most one volume, a volume is published at most once.
//!
//! The tables do no locking of their own beyond what [`DashMap`] gives; the
//! service serialises writers per volume and per path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{VolumeCapability, VolumeId};
use crate::uri::DeviceUri;

/// A volume whose device is attached (and, for filesystems, mounted) at a
/// node-global staging path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedVolume {
    pub volume_id: VolumeId,
    pub staging_target_path: PathBuf,
    pub capability: VolumeCapability,
    pub uri: DeviceUri,
    /// Local block device the uri resolved to.
    pub device: PathBuf,
    pub io_timeout: Option<Duration>,
}

/// A staged volume exposed at a workload path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedVolume {
    pub volume_id: VolumeId,
    pub target_path: PathBuf,
    pub staging_target_path: PathBuf,
    pub readonly: bool,
    pub capability: VolumeCapability,
}

impl PublishedVolume {
    /// Whether a publish request would recreate exactly this entry.
    pub fn matches(&self, readonly: bool, capability: &VolumeCapability) -> bool {
        self.readonly == readonly && &self.capability == capability
    }
}

#[derive(Debug, Default)]
pub struct StagingTable {
    entries: DashMap<VolumeId, StagedVolume>,
    paths: DashMap<PathBuf, VolumeId>,
}

impl StagingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, volume: &VolumeId) -> Option<StagedVolume> {
        self.entries.get(volume).map(|e| e.value().clone())
    }

    /// The volume staged at `path`, if any.
    pub fn volume_at(&self, path: &Path) -> Option<VolumeId> {
        self.paths.get(path).map(|e| e.value().clone())
    }

    pub fn insert(&self, staged: StagedVolume) {
        self.paths
            .insert(staged.staging_target_path.clone(), staged.volume_id.clone());
        self.entries.insert(staged.volume_id.clone(), staged);
    }

    pub fn remove(&self, volume: &VolumeId) -> Option<StagedVolume> {
        let (_, staged) = self.entries.remove(volume)?;
        self.paths.remove(&staged.staging_target_path);
        Some(staged)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PublishTable {
    entries: DashMap<PathBuf, PublishedVolume>,
    volumes: DashMap<VolumeId, PathBuf>,
}

impl PublishTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The publication at `target`, if any.
    pub fn get(&self, target: &Path) -> Option<PublishedVolume> {
        self.entries.get(target).map(|e| e.value().clone())
    }

    /// Where `volume` is published, if anywhere.
    pub fn target_of(&self, volume: &VolumeId) -> Option<PathBuf> {
        self.volumes.get(volume).map(|e| e.value().clone())
    }

    pub fn insert(&self, published: PublishedVolume) {
        self.volumes
            .insert(published.volume_id.clone(), published.target_path.clone());
        self.entries.insert(published.target_path.clone(), published);
    }

    pub fn remove(&self, target: &Path) -> Option<PublishedVolume> {
        let (_, published) = self.entries.remove(target)?;
        self.volumes.remove(&published.volume_id);
        Some(published)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessMode;

    fn staged(volume: &str, path: &str) -> StagedVolume {
        StagedVolume {
            volume_id: volume.into(),
            staging_target_path: path.into(),
            capability: VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4"),
            uri: DeviceUri::Nbd {
                device: "/dev/nbd0".into(),
            },
            device: "/dev/nbd0".into(),
            io_timeout: None,
        }
    }

    #[test]
    fn staging_reverse_index() {
        let table = StagingTable::new();
        table.insert(staged("v1", "/stage/v1"));
        assert_eq!(table.volume_at(Path::new("/stage/v1")), Some("v1".into()));
        assert!(table.volume_at(Path::new("/stage/v2")).is_none());

        let removed = table.remove(&"v1".into()).unwrap();
        assert_eq!(removed.staging_target_path, PathBuf::from("/stage/v1"));
        assert!(table.volume_at(Path::new("/stage/v1")).is_none());
        assert!(table.is_empty());
        assert!(table.remove(&"v1".into()).is_none());
    }

    #[test]
    fn publish_reverse_index() {
        let table = PublishTable::new();
        let cap = VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4");
        table.insert(PublishedVolume {
            volume_id: "v1".into(),
            target_path: "/pods/a".into(),
            staging_target_path: "/stage/v1".into(),
            readonly: false,
            capability: cap.clone(),
        });
        assert_eq!(table.target_of(&"v1".into()), Some(PathBuf::from("/pods/a")));
        let entry = table.get(Path::new("/pods/a")).unwrap();
        assert!(entry.matches(false, &cap));
        assert!(!entry.matches(true, &cap));

        table.remove(Path::new("/pods/a"));
        assert!(table.target_of(&"v1".into()).is_none());
        assert!(table.is_empty());
    }
}
