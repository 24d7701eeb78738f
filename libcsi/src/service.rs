//! The CSI node plugin.
//!
//! [`CsiNodeService`] owns the staging and publish tables and the per-volume
//! state, and implements [`CsiIdentity`] + [`CsiNode`] on top of a
//! [`NodeBackend`].
//!
//! Every operation follows the same shape:
//!
//! 1. validate the request (no locks held, nothing touched);
//! 2. lock the volume and the path involved;
//! 3. decide between no-op, conflict and work from the tables;
//! 4. run the host action under `op_timeout`;
//! 5. only then update tables and state.
//!
//! A failed, timed out or dropped host action therefore never leaves a table
//! entry behind.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::NodeBackend;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::lock::KeyedLocks;
use crate::node::CsiNode;
use crate::state::{NodeVolumeState, VolumeStates};
use crate::table::{PublishTable, PublishedVolume, StagedVolume, StagingTable};
use crate::types::*;
use crate::uri::parse_publish_context;

/// Topology segment naming the node.
pub const TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
/// Topology segment carrying the node's reachable address, when configured.
pub const ENDPOINT_KEY: &str = "openebs.io/csi-node-endpoint";

const SUPPORTED_FILESYSTEMS: [&str; 2] = ["ext4", "xfs"];
const DEFAULT_FILESYSTEM: &str = "ext4";

#[derive(Debug, Clone)]
pub struct NodeServiceConfig {
    pub node_name: String,
    /// Address other components reach this node at.
    pub endpoint: Option<String>,
    /// Reported in NodeGetInfo; `0` means no limit.
    pub max_volumes: u64,
    /// Bound on every attach, detach, mount and unmount.
    pub op_timeout: Duration,
}

impl NodeServiceConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            endpoint: None,
            max_volumes: 0,
            op_timeout: Duration::from_secs(60),
        }
    }
}

pub struct CsiNodeService {
    config: NodeServiceConfig,
    backend: Arc<dyn NodeBackend>,
    locks: KeyedLocks,
    states: VolumeStates,
    staging: StagingTable,
    publish: PublishTable,
}

impl CsiNodeService {
    pub fn new(config: NodeServiceConfig, backend: Arc<dyn NodeBackend>) -> Self {
        Self {
            config,
            backend,
            locks: KeyedLocks::new(),
            states: VolumeStates::new(),
            staging: StagingTable::new(),
            publish: PublishTable::new(),
        }
    }

    pub fn staging(&self) -> &StagingTable {
        &self.staging
    }

    pub fn published(&self) -> &PublishTable {
        &self.publish
    }

    pub fn state(&self, volume: &VolumeId) -> NodeVolumeState {
        self.states.get(volume)
    }

    /// Run a host action under `op_timeout`; expiry is a retryable
    /// [`CsiError::Unavailable`].
    async fn bounded<T>(
        &self,
        op: &str,
        action: impl Future<Output = Result<T, CsiError>>,
    ) -> Result<T, CsiError> {
        tokio::time::timeout(self.config.op_timeout, action)
            .await
            .map_err(|_| {
                warn!(op, timeout = ?self.config.op_timeout, "node operation timed out");
                CsiError::Unavailable(format!(
                    "{op} did not finish within {:?}",
                    self.config.op_timeout
                ))
            })?
    }
}

fn volume_key(volume: &VolumeId) -> String {
    format!("volume/{volume}")
}

fn path_key(path: &Path) -> String {
    format!("path/{}", path.display())
}

fn required_path(value: &str, field: &str) -> Result<PathBuf, CsiError> {
    if value.is_empty() {
        return Err(CsiError::missing(field));
    }
    Ok(PathBuf::from(value))
}

fn required_volume(volume: &VolumeId) -> Result<(), CsiError> {
    if volume.is_empty() {
        return Err(CsiError::missing("volume_id"));
    }
    Ok(())
}

/// A filesystem to create and mount: type plus mount flags.
type Filesystem = (String, Vec<String>);

/// Check a capability and return its access mode together with the
/// filesystem it asks for (`None` for raw block).
fn check_capability(
    capability: Option<&VolumeCapability>,
) -> Result<(AccessMode, Option<Filesystem>), CsiError> {
    let capability = capability.ok_or_else(|| CsiError::missing("volume_capability"))?;
    let mode = capability
        .access_mode
        .ok_or_else(|| CsiError::missing("volume_capability.access_mode"))?;
    let access_type = capability
        .access_type
        .as_ref()
        .ok_or_else(|| CsiError::missing("volume_capability.access_type"))?;
    let filesystem = match access_type {
        AccessType::Block => None,
        AccessType::Mount {
            fs_type,
            mount_flags,
        } => {
            let fs_type = if fs_type.is_empty() {
                DEFAULT_FILESYSTEM
            } else {
                fs_type.as_str()
            };
            if !SUPPORTED_FILESYSTEMS.contains(&fs_type) {
                return Err(CsiError::InvalidArgument(format!(
                    "filesystem {fs_type} is not supported, use one of {SUPPORTED_FILESYSTEMS:?}"
                )));
            }
            Some((fs_type.to_owned(), mount_flags.clone()))
        }
    };
    Ok((mode, filesystem))
}

fn access_kind(capability: &VolumeCapability) -> &'static str {
    if capability.is_block() { "block" } else { "mount" }
}

#[async_trait]
impl CsiIdentity for CsiNodeService {
    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(self.backend.ready())
    }
}

#[async_trait]
impl CsiNode for CsiNodeService {
    #[instrument(skip_all, fields(volume.uuid = %req.volume_id, staging_target_path = %req.staging_target_path))]
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        required_volume(&req.volume_id)?;
        let staging_path = required_path(&req.staging_target_path, "staging_target_path")?;
        let (_, filesystem) = check_capability(req.volume_capability.as_ref())?;
        let capability = req.volume_capability.unwrap_or_default();
        let (uri, io_timeout) = parse_publish_context(&req.publish_context)?;
        let volume = req.volume_id;

        let _guard = self
            .locks
            .lock([volume_key(&volume), path_key(&staging_path)])
            .await;

        if let Some(staged) = self.staging.get(&volume) {
            if staged.staging_target_path != staging_path {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {volume} staged at {}",
                    staged.staging_target_path.display()
                )));
            }
            if staged.capability != capability {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {volume} staged with a different capability"
                )));
            }
            debug!("volume already staged");
            return Ok(());
        }
        if let Some(other) = self.staging.volume_at(&staging_path) {
            return Err(CsiError::AlreadyExists(format!(
                "staging path {} holds volume {other}",
                staging_path.display()
            )));
        }

        let device = self
            .bounded("attach", self.backend.attach(&uri, io_timeout))
            .await?;
        if let Some((fs_type, flags)) = &filesystem {
            let mounted = self
                .bounded(
                    "mount",
                    self.backend
                        .mount_filesystem(&device, &staging_path, fs_type, flags),
                )
                .await;
            if let Err(e) = mounted {
                if let Err(detach) = self.bounded("detach", self.backend.detach(&uri)).await {
                    warn!(error = %detach, "detach after failed mount");
                }
                return Err(e);
            }
        }

        self.states.transition(&volume, NodeVolumeState::Staged)?;
        self.staging.insert(StagedVolume {
            volume_id: volume,
            staging_target_path: staging_path,
            capability,
            uri,
            device: device.clone(),
            io_timeout,
        });
        info!(device = %device.display(), "volume staged");
        Ok(())
    }

    #[instrument(skip_all, fields(volume.uuid = %req.volume_id, staging_target_path = %req.staging_target_path))]
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        required_volume(&req.volume_id)?;
        let staging_path = required_path(&req.staging_target_path, "staging_target_path")?;
        let volume = req.volume_id;

        let _guard = self
            .locks
            .lock([volume_key(&volume), path_key(&staging_path)])
            .await;

        let Some(staged) = self.staging.get(&volume) else {
            debug!("volume not staged");
            return Ok(());
        };
        if staged.staging_target_path != staging_path {
            return Err(CsiError::InvalidArgument(format!(
                "volume {volume} is staged at {}",
                staged.staging_target_path.display()
            )));
        }
        if let Some(target) = self.publish.target_of(&volume) {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume} is still published at {}",
                target.display()
            )));
        }

        if matches!(
            staged.capability.access_type,
            Some(AccessType::Mount { .. })
        ) {
            self.bounded("unmount", self.backend.unmount(&staging_path))
                .await?;
        }
        self.bounded("detach", self.backend.detach(&staged.uri))
            .await?;

        self.states.transition(&volume, NodeVolumeState::Unstaged)?;
        self.staging.remove(&volume);
        info!("volume unstaged");
        Ok(())
    }

    #[instrument(skip_all, fields(volume.uuid = %req.volume_id, target_path = %req.target_path))]
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        required_volume(&req.volume_id)?;
        let staging_path = required_path(&req.staging_target_path, "staging_target_path")?;
        let target = required_path(&req.target_path, "target_path")?;
        let (mode, _) = check_capability(req.volume_capability.as_ref())?;
        if mode.is_reader_only() && !req.readonly {
            return Err(CsiError::InvalidArgument(format!(
                "{mode:?} volumes must be published read-only"
            )));
        }
        let capability = req.volume_capability.unwrap_or_default();
        let volume = req.volume_id;

        let _guard = self
            .locks
            .lock([volume_key(&volume), path_key(&target)])
            .await;

        let staged = self.staging.get(&volume).ok_or_else(|| {
            CsiError::FailedPrecondition(format!("volume {volume} is not staged"))
        })?;
        if staged.staging_target_path != staging_path {
            return Err(CsiError::InvalidArgument(format!(
                "volume {volume} is staged at {}",
                staged.staging_target_path.display()
            )));
        }
        if staged
            .capability
            .access_mode
            .is_some_and(|m| m.is_reader_only())
            && !req.readonly
        {
            return Err(CsiError::InvalidArgument(format!(
                "volume {volume} was staged read-only"
            )));
        }
        if staged.capability.is_block() != capability.is_block() {
            return Err(CsiError::InvalidArgument(format!(
                "volume {volume} was staged as {}, not {}",
                access_kind(&staged.capability),
                access_kind(&capability)
            )));
        }

        if let Some(existing) = self.publish.get(&target) {
            if existing.volume_id != volume {
                return Err(CsiError::AlreadyExists(format!(
                    "target {} holds volume {}",
                    target.display(),
                    existing.volume_id
                )));
            }
            if existing.matches(req.readonly, &capability) {
                debug!("volume already published");
                return Ok(());
            }
            return Err(CsiError::AlreadyExists(format!(
                "volume {volume} published at {} with different parameters",
                target.display()
            )));
        }
        if let Some(other) = self.publish.target_of(&volume) {
            return Err(CsiError::Internal(format!(
                "volume {volume} is already published at {}",
                other.display()
            )));
        }

        let source = if staged.capability.is_block() {
            staged.device.clone()
        } else {
            staging_path.clone()
        };
        self.bounded(
            "bind mount",
            self.backend.bind_mount(&source, &target, req.readonly),
        )
        .await?;

        self.states.transition(&volume, NodeVolumeState::Published)?;
        self.publish.insert(PublishedVolume {
            volume_id: volume,
            target_path: target,
            staging_target_path: staging_path,
            readonly: req.readonly,
            capability,
        });
        info!(readonly = req.readonly, "volume published");
        Ok(())
    }

    #[instrument(skip_all, fields(volume.uuid = %req.volume_id, target_path = %req.target_path))]
    async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        required_volume(&req.volume_id)?;
        let target = required_path(&req.target_path, "target_path")?;
        let volume = req.volume_id;

        let _guard = self
            .locks
            .lock([volume_key(&volume), path_key(&target)])
            .await;

        let Some(existing) = self.publish.get(&target) else {
            debug!("target not published");
            return Ok(());
        };
        if existing.volume_id != volume {
            return Err(CsiError::InvalidArgument(format!(
                "target {} belongs to volume {}",
                target.display(),
                existing.volume_id
            )));
        }

        self.bounded("unmount", self.backend.unmount(&target))
            .await?;

        self.states.transition(&volume, NodeVolumeState::Staged)?;
        self.publish.remove(&target);
        info!("volume unpublished");
        Ok(())
    }

    async fn node_get_volume_stats(
        &self,
        _req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError> {
        Err(CsiError::Unimplemented("NodeGetVolumeStats".to_owned()))
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn node_get_info(&self) -> Result<NodeInfo, CsiError> {
        let mut segments =
            HashMap::from([(TOPOLOGY_KEY.to_owned(), self.config.node_name.clone())]);
        if let Some(endpoint) = &self.config.endpoint {
            segments.insert(ENDPOINT_KEY.to_owned(), endpoint.clone());
        }
        Ok(NodeInfo {
            node_id: self.config.node_name.clone(),
            max_volumes: self.config.max_volumes,
            accessible_topology: Some(Topology { segments }),
        })
    }
}
