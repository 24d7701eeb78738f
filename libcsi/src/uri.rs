//! Device URIs handed over in the publish context.
//!
//! ```text
//! nvmf://<host>[:<port>]/<nqn>
//! iscsi://<host>[:<port>]/<iqn>[/<lun>]
//! nbd:///dev/nbd<N>
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::CsiError;

/// Publish-context key carrying the device URI.
pub const CONTEXT_URI: &str = "uri";
/// Publish-context key carrying the I/O timeout in seconds.
pub const CONTEXT_IO_TIMEOUT: &str = "ioTimeout";

const NVMF_PORT: u16 = 4420;
const ISCSI_PORT: u16 = 3260;

/// Where a volume's block device is reached from this node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceUri {
    Nvmf { host: String, port: u16, nqn: String },
    Iscsi { host: String, port: u16, iqn: String, lun: u16 },
    Nbd { device: PathBuf },
}

impl FromStr for DeviceUri {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| CsiError::InvalidArgument(format!("uri '{s}': {e}")))?;
        let invalid = |why: &str| CsiError::InvalidArgument(format!("uri '{s}': {why}"));
        let host = || {
            url.host_str()
                .filter(|h| !h.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| invalid("missing host"))
        };
        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();

        match url.scheme() {
            "nvmf" | "nvmf+tcp" => {
                let nqn = segments.next().ok_or_else(|| invalid("missing nqn"))?;
                Ok(Self::Nvmf {
                    host: host()?,
                    port: url.port().unwrap_or(NVMF_PORT),
                    nqn: nqn.to_owned(),
                })
            }
            "iscsi" => {
                let iqn = segments.next().ok_or_else(|| invalid("missing iqn"))?;
                let lun = match segments.next() {
                    Some(lun) => lun.parse().map_err(|_| invalid("lun must be a number"))?,
                    None => 0,
                };
                Ok(Self::Iscsi {
                    host: host()?,
                    port: url.port().unwrap_or(ISCSI_PORT),
                    iqn: iqn.to_owned(),
                    lun,
                })
            }
            "nbd" => {
                let path = url.path();
                if !path.starts_with("/dev/nbd") {
                    return Err(invalid("nbd device must be /dev/nbd<N>"));
                }
                Ok(Self::Nbd {
                    device: PathBuf::from(path),
                })
            }
            other => Err(CsiError::InvalidArgument(format!(
                "unsupported uri scheme '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DeviceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nvmf { host, port, nqn } => write!(f, "nvmf://{host}:{port}/{nqn}"),
            Self::Iscsi { host, port, iqn, lun } => write!(f, "iscsi://{host}:{port}/{iqn}/{lun}"),
            Self::Nbd { device } => write!(f, "nbd://{}", device.display()),
        }
    }
}

/// The device URI and optional I/O timeout from a publish context.
pub fn parse_publish_context(
    context: &HashMap<String, String>,
) -> Result<(DeviceUri, Option<Duration>), CsiError> {
    let uri = context
        .get(CONTEXT_URI)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| CsiError::missing("publish_context.uri"))?
        .parse()?;
    let io_timeout = context
        .get(CONTEXT_IO_TIMEOUT)
        .map(|t| {
            t.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| CsiError::InvalidArgument(format!("ioTimeout '{t}' is not a number of seconds")))
        })
        .transpose()?;
    Ok((uri, io_timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nvmf() {
        let uri: DeviceUri = "nvmf://10.1.0.5:8420/nqn.2019-05.io.openebs:c1:5cd5378e"
            .parse()
            .unwrap();
        assert_eq!(
            uri,
            DeviceUri::Nvmf {
                host: "10.1.0.5".into(),
                port: 8420,
                nqn: "nqn.2019-05.io.openebs:c1:5cd5378e".into(),
            }
        );
        let uri: DeviceUri = "nvmf://node-1/nqn.x".parse().unwrap();
        assert!(matches!(uri, DeviceUri::Nvmf { port: 4420, .. }));
    }

    #[test]
    fn parse_iscsi_and_nbd() {
        let uri: DeviceUri = "iscsi://node-1:3260/iqn.2019-05.io.openebs:v1/2".parse().unwrap();
        assert!(matches!(uri, DeviceUri::Iscsi { lun: 2, .. }));
        let uri: DeviceUri = "nbd:///dev/nbd3".parse().unwrap();
        assert_eq!(uri, DeviceUri::Nbd { device: "/dev/nbd3".into() });
    }

    #[test]
    fn reject_bad_uris() {
        for bad in ["rdma://h/x", "nvmf://host", "nbd:///tmp/file", "not a uri"] {
            assert!(
                matches!(bad.parse::<DeviceUri>(), Err(CsiError::InvalidArgument(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn publish_context_io_timeout() {
        let context = HashMap::from([
            (CONTEXT_URI.to_owned(), "nbd:///dev/nbd0".to_owned()),
            (CONTEXT_IO_TIMEOUT.to_owned(), "30".to_owned()),
        ]);
        let (_, timeout) = parse_publish_context(&context).unwrap();
        assert_eq!(timeout, Some(Duration::from_secs(30)));

        assert!(parse_publish_context(&HashMap::new()).is_err());
        let bad = HashMap::from([
            (CONTEXT_URI.to_owned(), "nbd:///dev/nbd0".to_owned()),
            (CONTEXT_IO_TIMEOUT.to_owned(), "soon".to_owned()),
        ]);
        assert!(matches!(parse_publish_context(&bad), Err(CsiError::InvalidArgument(_))));
    }
}
