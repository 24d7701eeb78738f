//! Socket client used by the orchestrator side to issue CSI requests.
//!
//! [`CsiClient`] implements [`CsiIdentity`] and [`CsiNode`] itself, so a
//! caller holds the remote plugin behind the same traits as a local one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::read_message;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;
use crate::types::*;

/// A CSI client that opens one socket connection per request.
#[derive(Debug, Clone)]
pub struct CsiClient {
    path: PathBuf,
}

impl CsiClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// A plugin that is not listening is reported as
    /// [`CsiError::Unavailable`].
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            CsiError::Unavailable(format!("connect {}: {e}", self.path.display()))
        })?;
        let (read, mut write) = stream.into_split();

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        write
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        write.shutdown().await.map_err(CsiError::transport)?;

        let buf = read_message(read).await?;
        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`Self::request`], with [`CsiMessage::Error`] turned into `Err`.
    async fn call(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        match self.request(&msg).await? {
            CsiMessage::Error(e) => Err(e),
            response => Ok(response),
        }
    }
}

fn unexpected(response: CsiMessage) -> CsiError {
    CsiError::Transport(format!("unexpected response: {response}"))
}

#[async_trait]
impl CsiIdentity for CsiClient {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        match self.call(CsiMessage::GetPluginInfo).await? {
            CsiMessage::PluginInfoResponse(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        match self.call(CsiMessage::GetPluginCapabilities).await? {
            CsiMessage::PluginCapabilitiesResponse(caps) => Ok(caps),
            other => Err(unexpected(other)),
        }
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        match self.call(CsiMessage::Probe).await? {
            CsiMessage::ProbeResult(ready) => Ok(ready),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl CsiNode for CsiClient {
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        match self.call(CsiMessage::StageVolume(req)).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        match self.call(CsiMessage::UnstageVolume(req)).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        match self.call(CsiMessage::PublishVolume(req)).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        match self.call(CsiMessage::UnpublishVolume(req)).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError> {
        match self.call(CsiMessage::GetVolumeStats(req)).await? {
            CsiMessage::VolumeStatsResponse(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        match self.call(CsiMessage::GetNodeCapabilities).await? {
            CsiMessage::NodeCapabilitiesResponse(caps) => Ok(caps),
            other => Err(unexpected(other)),
        }
    }

    async fn node_get_info(&self) -> Result<NodeInfo, CsiError> {
        match self.call(CsiMessage::GetNodeInfo).await? {
            CsiMessage::NodeInfoResponse(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }
}
