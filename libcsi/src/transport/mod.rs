//! Local-socket transport for CSI messages.
//!
//! [`CsiServer`](server::CsiServer) listens on a Unix domain socket and
//! [`CsiClient`](client::CsiClient) talks to it.  Each connection carries one
//! JSON-encoded [`CsiMessage`](crate::message::CsiMessage) request, the
//! client shuts down its write half, and the server answers with one
//! response before closing.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CsiError;

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;

/// Upper bound for one encoded message.
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Read until EOF, refusing anything larger than [`MAX_MESSAGE_BYTES`].
pub(crate) async fn read_message<R: AsyncRead + Unpin>(reader: R) -> Result<Vec<u8>, CsiError> {
    let mut buf = Vec::new();
    reader
        .take(MAX_MESSAGE_BYTES + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(CsiError::transport)?;
    if buf.len() as u64 > MAX_MESSAGE_BYTES {
        return Err(CsiError::Transport(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::NodeBackend;
    use crate::identity::{CsiIdentity, PLUGIN_NAME};
    use crate::node::CsiNode;
    use crate::service::{CsiNodeService, NodeServiceConfig};
    use crate::types::*;
    use crate::uri::{CONTEXT_URI, DeviceUri};

    struct NullBackend;

    #[async_trait]
    impl NodeBackend for NullBackend {
        fn ready(&self) -> bool {
            true
        }
        async fn attach(
            &self,
            _uri: &DeviceUri,
            _io_timeout: Option<Duration>,
        ) -> Result<PathBuf, CsiError> {
            Ok("/dev/nbd0".into())
        }
        async fn detach(&self, _uri: &DeviceUri) -> Result<(), CsiError> {
            Ok(())
        }
        async fn mount_filesystem(
            &self,
            _device: &Path,
            _target: &Path,
            _fs_type: &str,
            _flags: &[String],
        ) -> Result<(), CsiError> {
            Ok(())
        }
        async fn bind_mount(&self, _s: &Path, _t: &Path, _ro: bool) -> Result<(), CsiError> {
            Ok(())
        }
        async fn unmount(&self, _target: &Path) -> Result<(), CsiError> {
            Ok(())
        }
    }

    async fn start(dir: &Path) -> (CsiClient, tokio::task::JoinHandle<()>, Arc<CsiNodeService>) {
        let socket = dir.join("csi.sock");
        let service = Arc::new(CsiNodeService::new(
            NodeServiceConfig::new("node-1"),
            Arc::new(NullBackend),
        ));
        let server = CsiServer::bind(&socket, Arc::clone(&service)).unwrap();
        let task = tokio::spawn(async move {
            server.serve().await.unwrap();
        });
        (CsiClient::new(&socket), task, service)
    }

    #[tokio::test]
    async fn node_lifecycle_over_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, task, service) = start(tmp.path()).await;

        assert!(client.probe().await.unwrap());
        assert_eq!(client.get_plugin_info().await.unwrap().name, PLUGIN_NAME);
        assert_eq!(client.node_get_info().await.unwrap().node_id, "node-1");

        let cap = VolumeCapability::mount(AccessMode::SingleNodeWriter, "ext4");
        let stage = NodeStageVolumeRequest {
            volume_id: "v1".into(),
            publish_context: [(CONTEXT_URI.to_owned(), "nbd:///dev/nbd0".to_owned())].into(),
            staging_target_path: "/stage/v1".into(),
            volume_capability: Some(cap.clone()),
            ..Default::default()
        };
        client.node_stage_volume(stage.clone()).await.unwrap();
        client.node_stage_volume(stage).await.unwrap();
        assert_eq!(service.staging().len(), 1);

        let publish = NodePublishVolumeRequest {
            volume_id: "v1".into(),
            staging_target_path: "/stage/v1".into(),
            target_path: "/pods/a".into(),
            volume_capability: Some(cap),
            ..Default::default()
        };
        client.node_publish_volume(publish).await.unwrap();

        let busy = client
            .node_unstage_volume(NodeUnstageVolumeRequest {
                volume_id: "v1".into(),
                staging_target_path: "/stage/v1".into(),
            })
            .await;
        assert!(matches!(busy, Err(CsiError::FailedPrecondition(_))));

        let stats = client
            .node_get_volume_stats(NodeGetVolumeStatsRequest::default())
            .await;
        assert!(matches!(stats, Err(CsiError::Unimplemented(_))));

        task.abort();
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("csi.sock"), b"stale").unwrap();
        let (client, task, _) = start(tmp.path()).await;
        assert!(
            tokio::time::timeout(Duration::from_secs(5), client.probe())
                .await
                .unwrap()
                .unwrap()
        );
        task.abort();
    }

    #[tokio::test]
    async fn missing_server_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let client = CsiClient::new(tmp.path().join("absent.sock"));
        let err = client.probe().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn response_variant_is_not_a_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (client, task, _) = start(tmp.path()).await;
        let reply = client.request(&crate::message::CsiMessage::Ok).await.unwrap();
        assert!(matches!(
            reply,
            crate::message::CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
        task.abort();
    }
}
