//! Node-level device and mount collaborators.
//!
//! [`NodeBackend`] is everything the node service needs from the host:
//! connecting a remote block device, putting a filesystem on it, and the
//! mount table operations.  [`linux::LinuxBackend`] drives the real host
//! tools; tests substitute a recording double.

pub mod linux;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::uri::DeviceUri;

#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Whether the initiator subsystem finished its startup checks.
    fn ready(&self) -> bool;

    /// Connect the device behind `uri` and return its local block device.
    /// `io_timeout` bounds each I/O the kernel issues to the device.
    async fn attach(
        &self,
        uri: &DeviceUri,
        io_timeout: Option<Duration>,
    ) -> Result<PathBuf, CsiError>;

    /// Disconnect the device behind `uri`.  Detaching a device that is not
    /// connected succeeds.
    async fn detach(&self, uri: &DeviceUri) -> Result<(), CsiError>;

    /// Mount `device` at `target` as `fs_type`, creating the filesystem
    /// first if the device carries none.
    async fn mount_filesystem(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        flags: &[String],
    ) -> Result<(), CsiError>;

    /// Bind `source` (a directory or a block device) onto `target`.
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
    -> Result<(), CsiError>;

    /// Unmount `target`.  A path that is not a mount point is left alone.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;
}
