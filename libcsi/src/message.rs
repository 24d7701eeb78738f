//! CSI protocol messages exchanged over the node plugin socket.
//!
//! [`CsiMessage`] is the envelope for every request and response.  A
//! connection carries exactly one request followed by one response; the
//! server answers with the matching response variant or
//! [`CsiMessage::Error`].

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Attach and mount a volume at its staging path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Undo a stage (Node).
    UnstageVolume(NodeUnstageVolumeRequest),
    /// Expose a staged volume at a workload path (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Remove a publication (Node).
    UnpublishVolume(NodeUnpublishVolumeRequest),
    /// Usage statistics (Node).
    GetVolumeStats(NodeGetVolumeStatsRequest),
    /// Query node info (Node).
    GetNodeInfo,
    /// Query node RPC capabilities (Node).
    GetNodeCapabilities,

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    VolumeStatsResponse(VolumeStats),
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is a request a server may dispatch.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::StageVolume(_)
                | Self::UnstageVolume(_)
                | Self::PublishVolume(_)
                | Self::UnpublishVolume(_)
                | Self::GetVolumeStats(_)
                | Self::GetNodeInfo
                | Self::GetNodeCapabilities
                | Self::Probe
                | Self::GetPluginInfo
                | Self::GetPluginCapabilities
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume(req) => write!(f, "UnstageVolume({})", req.volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume(req) => write!(f, "UnpublishVolume({})", req.volume_id),
            Self::GetVolumeStats(req) => write!(f, "GetVolumeStats({})", req.volume_id),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(used={})", stats.used_bytes)
            }
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_request_over_json() {
        let msg = CsiMessage::StageVolume(NodeStageVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stage/v1".into(),
            volume_capability: Some(VolumeCapability::block(AccessMode::SingleNodeWriter)),
            ..Default::default()
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, CsiMessage::StageVolume(ref req) if req.staging_target_path == "/stage/v1"));
        assert!(de.is_request());
    }

    #[test]
    fn error_response_keeps_its_code() {
        let msg = CsiMessage::Error(CsiError::Unimplemented("NodeGetVolumeStats".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        let CsiMessage::Error(e) = de else {
            panic!("expected an error");
        };
        assert_eq!(e.code(), tonic::Code::Unimplemented);
        assert!(!CsiMessage::Ok.is_request());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        assert_eq!(CsiMessage::Probe.to_string(), "Probe");
        let msg = CsiMessage::UnpublishVolume(NodeUnpublishVolumeRequest {
            volume_id: "v9".into(),
            target_path: "/pods/a".into(),
        });
        assert_eq!(msg.to_string(), "UnpublishVolume(v9)");
    }
}
