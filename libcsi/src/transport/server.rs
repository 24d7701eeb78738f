//! Socket server that runs on each worker node and dispatches incoming CSI
//! requests to the node plugin.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use super::read_message;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts local connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiNode`]
/// implementation.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiNode + 'static,
{
    /// Bind the socket at `path`, replacing a socket file left behind by a
    /// previous run.  Must be called inside a Tokio runtime.
    pub fn bind(path: impl AsRef<Path>, handler: Arc<T>) -> Result<Self, CsiError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CsiError::transport)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CsiError::transport(e)),
        }
        let listener = UnixListener::bind(&path).map_err(CsiError::transport)?;
        info!(path = %path.display(), "CSI node socket listening");
        Ok(Self {
            listener,
            path,
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the listener fails.  Each connection is
    /// handled on its own task.
    pub async fn serve(&self) -> Result<(), CsiError> {
        loop {
            let (stream, _) = self.listener.accept().await.map_err(CsiError::transport)?;
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(stream, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), CsiError> {
        tokio::select! {
            res = self.serve() => res,
            _ = shutdown => {
                info!("CSI node socket shutting down");
                Ok(())
            }
        }
    }

    /// Process a single connection: read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_stream(stream: UnixStream, handler: &T) -> Result<(), CsiError> {
        let (read, mut write) = stream.into_split();
        let buf = read_message(read).await?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                Self::dispatch(handler, request).await
            }
            Err(e) => {
                warn!(error = %e, "malformed CSI request");
                CsiMessage::Error(CsiError::InvalidArgument(format!("malformed request: {e}")))
            }
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        write
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        write.shutdown().await.map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        let response = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => handler
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => handler
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => {
                handler.node_stage_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnstageVolume(req) => {
                handler.node_unstage_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::PublishVolume(req) => {
                handler.node_publish_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnpublishVolume(req) => handler
                .node_unpublish_volume(req)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::GetVolumeStats(req) => handler
                .node_get_volume_stats(req)
                .await
                .map(CsiMessage::VolumeStatsResponse),
            CsiMessage::GetNodeInfo => handler
                .node_get_info()
                .await
                .map(CsiMessage::NodeInfoResponse),
            CsiMessage::GetNodeCapabilities => handler
                .node_get_capabilities()
                .await
                .map(CsiMessage::NodeCapabilitiesResponse),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                Err(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        };
        response.unwrap_or_else(CsiMessage::Error)
    }
}

impl<T> Drop for CsiServer<T> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "socket not removed");
        }
    }
}
