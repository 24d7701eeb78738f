//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a published volume
//! available to workloads in two steps:
//!
//! 1. **Stage** attaches the volume's block device and, for filesystem
//!    volumes, formats it if blank and mounts it at a node-global path.
//! 2. **Publish** bind-mounts the staged volume (or the raw device) at the
//!    workload's target path.
//!
//! Unpublish and Unstage undo those steps.  All four are idempotent.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeGetVolumeStatsRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest, VolumeStats,
};

/// Node service: attach, mount and expose volumes on the local host.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its staging path.
    ///
    /// Restaging the identical volume, path and capability succeeds without
    /// doing anything.
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.  Unstaging a volume that is not staged succeeds.
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError>;

    /// Publish a staged volume at its target path.
    ///
    /// Replaying an identical publish succeeds without doing anything.
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove a publication.  An unknown target path succeeds.
    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest)
    -> Result<(), CsiError>;

    /// Usage statistics for a published volume.
    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError>;

    /// RPCs this Node service supports beyond the mandatory ones.
    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn node_get_info(&self) -> Result<NodeInfo, CsiError>;
}
