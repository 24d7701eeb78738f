//! Host backend driving the Linux initiator tools and the mount table.
//!
//! # Devices
//!
//! | uri | attach | detach |
//! |---|---|---|
//! | `nvmf://` | `nvme connect -t tcp`, device found via `nvme list -v -o json` | `nvme disconnect -n <nqn>` |
//! | `iscsi://` | `iscsiadm` discovery + login, device under `/dev/disk/by-path` | `iscsiadm --logout` |
//! | `nbd://` | the uri path itself | nothing |
//!
//! An `ioTimeout` from the publish context is written to the NVMe device's
//! `queue/io_timeout` in sysfs once it is connected.
//!
//! Every external tool runs with `kill_on_drop`, so a caller that gives up on
//! an attach (timeout, cancellation) does not leave the command running.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::MsFlags;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::NodeBackend;
use crate::error::CsiError;
use crate::uri::DeviceUri;

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEVICE_POLL_ATTEMPTS: u32 = 50;
const SYSFS_BLOCK: &str = "/sys/block";
/// `blkid` exit status when the device carries no recognisable signature.
const BLKID_NOT_FOUND: i32 = 2;

pub struct LinuxBackend {
    nvme_nr_io_queues: Option<u32>,
    ready: AtomicBool,
}

impl LinuxBackend {
    pub fn new(nvme_nr_io_queues: Option<u32>) -> Self {
        Self {
            nvme_nr_io_queues,
            ready: AtomicBool::new(false),
        }
    }

    /// Load the initiator modules and mark the backend ready.  A failing
    /// `modprobe` is only logged: the module may be built in.
    pub async fn init(&self) {
        for module in ["nvme-tcp", "nbd"] {
            if let Err(e) = run("modprobe", &[module]).await {
                warn!(module, error = %e, "kernel module not loaded");
            }
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("node backend ready");
    }

    async fn nvme_device(&self, nqn: &str) -> Result<Option<PathBuf>, CsiError> {
        let listing = run("nvme", &["list", "-v", "-o", "json"]).await?;
        let json: Value = serde_json::from_str(&listing)
            .map_err(|e| CsiError::Backend(format!("nvme list output: {e}")))?;
        Ok(nvme_namespace_for(&json, nqn).map(|ns| PathBuf::from(format!("/dev/{ns}"))))
    }

    async fn attach_nvmf(&self, host: &str, port: u16, nqn: &str) -> Result<PathBuf, CsiError> {
        if let Some(device) = self.nvme_device(nqn).await? {
            debug!(%nqn, device = %device.display(), "nvmf target already connected");
            return Ok(device);
        }
        let port = port.to_string();
        let queues = self.nvme_nr_io_queues.map(|n| n.to_string());
        let mut args = vec!["connect", "-t", "tcp", "-a", host, "-s", port.as_str(), "-n", nqn];
        if let Some(queues) = queues.as_deref() {
            args.extend(["-i", queues]);
        }
        run("nvme", &args).await?;

        for _ in 0..DEVICE_POLL_ATTEMPTS {
            if let Some(device) = self.nvme_device(nqn).await? {
                return Ok(device);
            }
            tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
        }
        Err(CsiError::Backend(format!("no namespace appeared for {nqn}")))
    }

    async fn attach_iscsi(
        &self,
        host: &str,
        port: u16,
        iqn: &str,
        lun: u16,
    ) -> Result<PathBuf, CsiError> {
        let device = iscsi_by_path(host, port, iqn, lun);
        if device.exists() {
            return Ok(device);
        }
        let portal = format!("{host}:{port}");
        run("iscsiadm", &["-m", "discovery", "-t", "sendtargets", "-p", &portal]).await?;
        run("iscsiadm", &["-m", "node", "-T", iqn, "-p", &portal, "--login"]).await?;
        wait_for(&device).await?;
        Ok(device)
    }
}

#[async_trait]
impl NodeBackend for LinuxBackend {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, uri), fields(uri = %uri))]
    async fn attach(
        &self,
        uri: &DeviceUri,
        io_timeout: Option<Duration>,
    ) -> Result<PathBuf, CsiError> {
        let device = match uri {
            DeviceUri::Nvmf { host, port, nqn } => {
                let device = self.attach_nvmf(host, *port, nqn).await?;
                if let Some(timeout) = io_timeout {
                    set_io_timeout(Path::new(SYSFS_BLOCK), &device, timeout).await?;
                }
                device
            }
            DeviceUri::Iscsi {
                host,
                port,
                iqn,
                lun,
            } => self.attach_iscsi(host, *port, iqn, *lun).await?,
            DeviceUri::Nbd { device } => {
                wait_for(device).await?;
                device.clone()
            }
        };
        info!(device = %device.display(), "device attached");
        Ok(device)
    }

    #[instrument(skip(self, uri), fields(uri = %uri))]
    async fn detach(&self, uri: &DeviceUri) -> Result<(), CsiError> {
        match uri {
            DeviceUri::Nvmf { nqn, .. } => {
                run("nvme", &["disconnect", "-n", nqn]).await?;
            }
            DeviceUri::Iscsi {
                host,
                port,
                iqn,
                lun,
            } => {
                if !iscsi_by_path(host, *port, iqn, *lun).exists() {
                    debug!("no iscsi session, nothing to log out");
                    return Ok(());
                }
                let portal = format!("{host}:{port}");
                run("iscsiadm", &["-m", "node", "-T", iqn, "-p", &portal, "--logout"]).await?;
            }
            DeviceUri::Nbd { .. } => {}
        }
        info!("device detached");
        Ok(())
    }

    #[instrument(skip(self, flags))]
    async fn mount_filesystem(
        &self,
        device: &Path,
        target: &Path,
        fs_type: &str,
        flags: &[String],
    ) -> Result<(), CsiError> {
        let mount_failed = |reason: String| CsiError::MountFailed {
            path: target.display().to_string(),
            reason,
        };
        if is_mountpoint(target).await {
            debug!("staging path already mounted");
            return Ok(());
        }
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| mount_failed(e.to_string()))?;

        match probe_filesystem(device).await? {
            None => {
                info!(device = %device.display(), fs_type, "formatting blank device");
                let dev = device.to_string_lossy();
                run(&format!("mkfs.{fs_type}"), &[dev.as_ref()]).await?;
            }
            Some(existing) if existing != fs_type => {
                return Err(mount_failed(format!(
                    "device carries {existing}, requested {fs_type}"
                )));
            }
            Some(_) => {}
        }

        let (ms_flags, data) = mount_options(flags);
        let (device, target_path, fs_type) =
            (device.to_owned(), target.to_owned(), fs_type.to_owned());
        tokio::task::spawn_blocking(move || {
            nix::mount::mount(
                Some(device.as_path()),
                target_path.as_path(),
                Some(fs_type.as_str()),
                ms_flags,
                (!data.is_empty()).then_some(data.as_str()),
            )
        })
        .await
        .map_err(CsiError::internal)?
        .map_err(|e| mount_failed(e.to_string()))?;

        info!("filesystem mounted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), CsiError> {
        let mount_failed = |reason: String| CsiError::MountFailed {
            path: target.display().to_string(),
            reason,
        };
        if is_mountpoint(target).await {
            debug!("target already mounted");
            return Ok(());
        }

        // A block device is bound onto a file, a directory onto a directory.
        let source_is_dir = tokio::fs::metadata(source)
            .await
            .map(|m| m.is_dir())
            .map_err(|e| mount_failed(format!("source {}: {e}", source.display())))?;
        let prepared = if source_is_dir {
            tokio::fs::create_dir_all(target).await
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| mount_failed(e.to_string()))?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(target)
                .await
                .map(|_| ())
        };
        prepared.map_err(|e| mount_failed(e.to_string()))?;

        let (source, target_path) = (source.to_owned(), target.to_owned());
        tokio::task::spawn_blocking(move || -> nix::Result<()> {
            nix::mount::mount(
                Some(source.as_path()),
                target_path.as_path(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            // MS_RDONLY is ignored on the initial bind; it needs a remount.
            if read_only {
                nix::mount::mount(
                    None::<&str>,
                    target_path.as_path(),
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )?;
            }
            Ok(())
        })
        .await
        .map_err(CsiError::internal)?
        .map_err(|e| mount_failed(e.to_string()))?;

        info!("bind mount created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        if !is_mountpoint(target).await {
            debug!("not a mount point, nothing to unmount");
            return Ok(());
        }
        let target_path = target.to_owned();
        tokio::task::spawn_blocking(move || nix::mount::umount(target_path.as_path()))
            .await
            .map_err(CsiError::internal)?
            .map_err(|e| CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            })?;
        info!("unmounted");
        Ok(())
    }
}

/// Run `program` and return its stdout, failing on a non-zero exit.
async fn run(program: &str, args: &[&str]) -> Result<String, CsiError> {
    debug!(program, ?args, "exec");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CsiError::Backend(format!("{program}: {e}")))?;
    if !output.status.success() {
        return Err(CsiError::Backend(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The filesystem type on `device`, `None` when it is blank.
async fn probe_filesystem(device: &Path) -> Result<Option<String>, CsiError> {
    let output = Command::new("blkid")
        .args(["-o", "value", "-s", "TYPE"])
        .arg(device)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CsiError::Backend(format!("blkid: {e}")))?;
    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            Ok((!fs.is_empty()).then_some(fs))
        }
        Some(BLKID_NOT_FOUND) => Ok(None),
        _ => Err(CsiError::Backend(format!(
            "blkid {}: {}",
            device.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

async fn wait_for(device: &Path) -> Result<(), CsiError> {
    for _ in 0..DEVICE_POLL_ATTEMPTS {
        if tokio::fs::try_exists(device).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
    }
    Err(CsiError::Backend(format!(
        "device {} did not appear",
        device.display()
    )))
}

/// Set the timeout the block layer applies to each request sent to `device`.
async fn set_io_timeout(sysfs_block: &Path, device: &Path, timeout: Duration) -> Result<(), CsiError> {
    let name = device
        .file_name()
        .ok_or_else(|| CsiError::Backend(format!("{} is not a device node", device.display())))?;
    let knob = sysfs_block.join(name).join("queue").join("io_timeout");
    tokio::fs::write(&knob, timeout.as_millis().to_string())
        .await
        .map_err(|e| CsiError::Backend(format!("write {}: {e}", knob.display())))?;
    debug!(device = %device.display(), ?timeout, "io timeout set");
    Ok(())
}

fn iscsi_by_path(host: &str, port: u16, iqn: &str, lun: u16) -> PathBuf {
    PathBuf::from(format!(
        "/dev/disk/by-path/ip-{host}:{port}-iscsi-{iqn}-lun-{lun}"
    ))
}

/// Find the namespace of the subsystem `nqn` in `nvme list -v` output.
/// The nesting differs between nvme-cli releases, so the tree is searched.
fn nvme_namespace_for(listing: &Value, nqn: &str) -> Option<String> {
    match listing {
        Value::Object(map) => {
            if map.get("SubsystemNQN").and_then(Value::as_str) == Some(nqn) {
                return first_string(listing, "NameSpace");
            }
            map.values().find_map(|v| nvme_namespace_for(v, nqn))
        }
        Value::Array(items) => items.iter().find_map(|v| nvme_namespace_for(v, nqn)),
        _ => None,
    }
}

fn first_string(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| map.values().find_map(|v| first_string(v, key))),
        Value::Array(items) => items.iter().find_map(|v| first_string(v, key)),
        _ => None,
    }
}

/// Split CSI mount flags into kernel flags and the filesystem data string.
fn mount_options(flags: &[String]) -> (MsFlags, String) {
    let mut ms = MsFlags::empty();
    let mut data = Vec::new();
    for flag in flags {
        match flag.as_str() {
            "ro" => ms |= MsFlags::MS_RDONLY,
            "noatime" => ms |= MsFlags::MS_NOATIME,
            "nodiratime" => ms |= MsFlags::MS_NODIRATIME,
            "nosuid" => ms |= MsFlags::MS_NOSUID,
            "nodev" => ms |= MsFlags::MS_NODEV,
            "noexec" => ms |= MsFlags::MS_NOEXEC,
            "sync" => ms |= MsFlags::MS_SYNCHRONOUS,
            "rw" | "defaults" => {}
            other => data.push(other),
        }
    }
    (ms, data.join(","))
}

/// Return `true` if `path` is listed as a mount point in `/proc/self/mounts`.
async fn is_mountpoint(path: &Path) -> bool {
    match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(contents) => listed_in(&contents, path),
        Err(_) => false,
    }
}

// Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
fn listed_in(mounts: &str, path: &Path) -> bool {
    let Some(path) = path.to_str() else {
        return false;
    };
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_from_nested_listing() {
        let listing: Value = serde_json::from_str(
            r#"{"Devices":[{"HostNQN":"h","Subsystems":[
                {"SubsystemNQN":"nqn.other","Namespaces":[{"NameSpace":"nvme0n1"}]},
                {"SubsystemNQN":"nqn.2019-05.io.openebs:v1",
                 "Controllers":[{"Controller":"nvme1","Namespaces":[{"NameSpace":"nvme1n1"}]}]}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(
            nvme_namespace_for(&listing, "nqn.2019-05.io.openebs:v1").as_deref(),
            Some("nvme1n1")
        );
        assert!(nvme_namespace_for(&listing, "nqn.missing").is_none());
    }

    #[test]
    fn namespace_from_flat_listing() {
        let listing: Value = serde_json::from_str(
            r#"{"Devices":[{"SubsystemNQN":"nqn.a","Namespaces":[{"NameSpace":"nvme2n1"}]}]}"#,
        )
        .unwrap();
        assert_eq!(nvme_namespace_for(&listing, "nqn.a").as_deref(), Some("nvme2n1"));
    }

    #[test]
    fn split_mount_flags() {
        let flags = ["noatime", "ro", "discard", "rw", "commit=30"].map(String::from);
        let (ms, data) = mount_options(&flags);
        assert_eq!(ms, MsFlags::MS_NOATIME | MsFlags::MS_RDONLY);
        assert_eq!(data, "discard,commit=30");
    }

    #[test]
    fn mount_table_lookup() {
        let mounts = "proc /proc proc rw 0 0\n/dev/nvme1n1 /var/lib/stage/v1 ext4 rw 0 0\n";
        assert!(listed_in(mounts, Path::new("/var/lib/stage/v1")));
        assert!(!listed_in(mounts, Path::new("/var/lib/stage")));
    }

    #[test]
    fn iscsi_device_path() {
        assert_eq!(
            iscsi_by_path("10.0.0.1", 3260, "iqn.2019-05.io.openebs:v1", 0),
            PathBuf::from("/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-iqn.2019-05.io.openebs:v1-lun-0")
        );
    }

    #[tokio::test]
    async fn not_ready_before_init() {
        let backend = LinuxBackend::new(None);
        assert!(!backend.ready());
        let tmp = tempfile::tempdir().unwrap();
        // Unmounting a plain directory is a no-op.
        backend.unmount(tmp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn io_timeout_written_in_milliseconds() {
        let sysfs = tempfile::tempdir().unwrap();
        let queue = sysfs.path().join("nvme1n1").join("queue");
        std::fs::create_dir_all(&queue).unwrap();

        set_io_timeout(sysfs.path(), Path::new("/dev/nvme1n1"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(queue.join("io_timeout")).unwrap(), "30000");

        let err = set_io_timeout(sysfs.path(), Path::new("/dev/nvme2n1"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Backend(_)));
    }
}
