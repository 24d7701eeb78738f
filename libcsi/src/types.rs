//! Core CSI types: capabilities, node requests, plugin and node info.
//!
//! The shapes follow the CSI node-plugin schema.  String fields that CSI
//! treats as required are plain `String`s; an empty value means the caller
//! left the field out and is rejected by the service.  Everything is
//! [`Serialize`]/[`Deserialize`] so requests travel over the local socket as
//! JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// CSI access modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

impl AccessMode {
    /// Whether the mode only ever allows reading.
    pub fn is_reader_only(&self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

/// How the volume is exposed to the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    /// Raw block device.
    Block,
    /// Filesystem mount.
    Mount {
        /// Filesystem type; empty selects the plugin default.
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

/// Describes the capabilities required from a volume.
///
/// Both fields are optional on the wire; the service rejects a capability
/// missing either of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: Option<AccessMode>,
    pub access_type: Option<AccessType>,
}

impl VolumeCapability {
    /// A filesystem capability.
    pub fn mount(mode: AccessMode, fs_type: &str) -> Self {
        Self {
            access_mode: Some(mode),
            access_type: Some(AccessType::Mount {
                fs_type: fs_type.to_owned(),
                mount_flags: Vec::new(),
            }),
        }
    }

    /// A raw block capability.
    pub fn block(mode: AccessMode) -> Self {
        Self {
            access_mode: Some(mode),
            access_type: Some(AccessType::Block),
        }
    }

    /// Whether the volume is exposed as a raw device rather than mounted.
    pub fn is_block(&self) -> bool {
        matches!(self.access_type, Some(AccessType::Block))
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to stage a volume on a node: attach its device and, for
/// filesystem volumes, mount it at the staging path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Context handed over by the control plane; must carry `uri`.
    pub publish_context: HashMap<String, String>,
    /// Node-global staging mount point.
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    pub secrets: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
}

/// Request to undo a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: VolumeId,
    pub staging_target_path: String,
}

/// Request to publish (bind-mount) a staged volume at a workload path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    pub publish_context: HashMap<String, String>,
    /// The staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Workload-visible path.
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    pub readonly: bool,
    pub secrets: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
}

/// Request to remove a publication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
}

/// Usage figures for a published volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: HashMap<String, String>,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// RPC capabilities of the Node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"kubernetes.io/hostname": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    /// Maximum number of volumes the node can host; `0` means no limit.
    pub max_volumes: u64,
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_only_modes() {
        assert!(AccessMode::SingleNodeReaderOnly.is_reader_only());
        assert!(AccessMode::MultiNodeReaderOnly.is_reader_only());
        assert!(!AccessMode::MultiNodeSingleWriter.is_reader_only());
        assert!(!AccessMode::SingleNodeWriter.is_reader_only());
    }

    #[test]
    fn capability_wire_shape() {
        let cap = VolumeCapability::mount(AccessMode::MultiNodeSingleWriter, "ext4");
        let json = serde_json::to_value(&cap).unwrap();
        assert_eq!(json["access_mode"], "MULTI_NODE_SINGLE_WRITER");
        assert_eq!(json["access_type"]["mount"]["fs_type"], "ext4");

        let block: VolumeCapability =
            serde_json::from_str(r#"{"access_mode":"SINGLE_NODE_WRITER","access_type":"block"}"#)
                .unwrap();
        assert_eq!(block, VolumeCapability::block(AccessMode::SingleNodeWriter));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let req: NodeStageVolumeRequest = serde_json::from_str(r#"{"volume_id":"v1"}"#).unwrap();
        assert!(req.staging_target_path.is_empty());
        assert!(req.volume_capability.is_none());
        assert!(req.publish_context.is_empty());
    }
}
