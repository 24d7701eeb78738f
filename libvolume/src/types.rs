//! Control-plane data model: volumes, replicas, nexuses, pools.
//!
//! Identifiers are thin newtypes so that a replica uuid can never be passed
//! where a volume uuid is expected.  Every type is [`Serialize`] /
//! [`Deserialize`] so the read API can hand them to a REST front end as-is.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VolumeError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($name:ident, $what:literal) => {
        #[doc = concat!("UUID of a ", $what, ".")]
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            #[doc = concat!("Generate a fresh random ", $what, " id.")]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }

        impl FromStr for $name {
            type Err = VolumeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| VolumeError::InvalidArgument(format!("{} '{s}': {e}", $what)))
            }
        }
    };
}

uuid_id!(VolumeId, "volume");
uuid_id!(ReplicaId, "replica");
uuid_id!(NexusId, "nexus");

macro_rules! string_id {
    ($name:ident, $what:literal) => {
        #[doc = concat!("Name of a ", $what, ".")]
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw name.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(NodeId, "storage node");
string_id!(PoolId, "storage pool");

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Wire protocol a nexus is exposed over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nvmf,
    Iscsi,
    Nbd,
}

impl Protocol {
    /// URI scheme used in device URIs for this protocol.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Nvmf => "nvmf",
            Self::Iscsi => "iscsi",
            Self::Nbd => "nbd",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for Protocol {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nvmf" => Ok(Self::Nvmf),
            "iscsi" => Ok(Self::Iscsi),
            "nbd" => Ok(Self::Nbd),
            other => Err(VolumeError::InvalidArgument(format!(
                "unsupported protocol '{other}'"
            ))),
        }
    }
}

/// Lifecycle of the volume spec itself (as opposed to its runtime health).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpecStatus {
    Creating,
    Created,
    Deleting,
    Deleted,
}

/// Runtime health of a volume, always derived from its replicas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeStatus {
    Online,
    Degraded,
    Faulted,
    Unknown,
}

/// Health of a single replica.
///
/// `Degraded` means the replica exists but does not yet hold a full copy of
/// the data: it is waiting for, or undergoing, a rebuild.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaState {
    Online,
    Degraded,
    Faulted,
    Unknown,
}

impl ReplicaState {
    /// Whether the replica holds a complete, usable copy of the data.
    pub fn healthy(&self) -> bool {
        matches!(self, Self::Online)
    }

    /// Removal priority when shrinking a volume: lower goes first.
    pub(crate) fn removal_rank(&self) -> u8 {
        match self {
            Self::Faulted => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Online => 3,
        }
    }
}

/// Rebuild status of a nexus child.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChildRebuild {
    NotStarted,
    Rebuilding,
    Complete,
    Failed,
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Volume policy flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumePolicy {
    /// Let the reconcile loop replace faulted replicas automatically.
    pub self_heal: bool,
}

/// Request body for volume creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolume {
    pub uuid: VolumeId,
    pub size: u64,
    pub replicas: u8,
    #[serde(default)]
    pub policy: VolumePolicy,
}

/// The desired state of a volume, as recorded by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub uuid: VolumeId,
    /// Immutable after creation.
    pub size: u64,
    pub num_replicas: u8,
    pub policy: VolumePolicy,
    pub status: SpecStatus,
    /// Node and protocol of the published target, if any.
    pub target: Option<TargetSpec>,
}

/// Where and how a volume is published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSpec {
    pub node: NodeId,
    pub protocol: Protocol,
}

/// Placement and health of one replica, as reported in the volume state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaTopology {
    pub node: NodeId,
    pub pool: PoolId,
    pub state: ReplicaState,
}

/// Observed state of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeState {
    pub uuid: VolumeId,
    pub size: u64,
    pub status: VolumeStatus,
    pub target: Option<Nexus>,
    pub replica_topology: BTreeMap<ReplicaId, ReplicaTopology>,
}

/// Spec plus state: what `GET /volumes/{id}` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub spec: VolumeSpec,
    pub state: VolumeState,
}

// ---------------------------------------------------------------------------
// Replica, nexus, pool
// ---------------------------------------------------------------------------

/// A single data copy of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub uuid: ReplicaId,
    /// Owning volume; `None` for an orphan awaiting garbage collection.
    pub owner: Option<VolumeId>,
    pub node: NodeId,
    pub pool: PoolId,
    pub size: u64,
    pub state: ReplicaState,
    /// URI the nexus uses to reach this replica.
    pub uri: String,
    /// Monotonic creation sequence; higher means more recently added.
    pub(crate) seq: u64,
    #[serde(skip)]
    pub(crate) faulted_at: Option<std::time::Instant>,
}

/// A replica attached to a nexus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NexusChild {
    pub replica: ReplicaId,
    pub uri: String,
    pub rebuild: ChildRebuild,
    /// Rebuild progress in percent, when a rebuild has been observed.
    pub rebuild_progress: Option<u8>,
}

/// The aggregation device publishing a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Nexus {
    pub uuid: NexusId,
    pub volume: VolumeId,
    pub node: NodeId,
    pub protocol: Protocol,
    pub device_uri: String,
    pub children: Vec<NexusChild>,
}

impl Nexus {
    /// Look up the child backed by `replica`.
    pub fn child(&self, replica: &ReplicaId) -> Option<&NexusChild> {
        self.children.iter().find(|c| &c.replica == replica)
    }
}

/// A storage pool that replicas are carved from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub id: PoolId,
    pub node: NodeId,
    pub capacity: u64,
    pub used: u64,
}

impl Pool {
    /// Bytes still available for new replicas.
    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_and_display() {
        assert_eq!("nvmf".parse::<Protocol>().unwrap(), Protocol::Nvmf);
        assert_eq!(Protocol::Iscsi.to_string(), "iscsi");
        assert!(matches!(
            "rdma".parse::<Protocol>(),
            Err(VolumeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn volume_id_parse() {
        let id: VolumeId = "5cd5378e-3f05-47f1-a830-a0f5873a1449".parse().unwrap();
        assert_eq!(id.to_string(), "5cd5378e-3f05-47f1-a830-a0f5873a1449");
        assert!("not-a-uuid".parse::<VolumeId>().is_err());
    }

    #[test]
    fn faulted_replicas_are_removed_first() {
        let mut states = [
            ReplicaState::Online,
            ReplicaState::Faulted,
            ReplicaState::Degraded,
            ReplicaState::Unknown,
        ];
        states.sort_by_key(|s| s.removal_rank());
        assert_eq!(states[0], ReplicaState::Faulted);
        assert_eq!(states[3], ReplicaState::Online);
    }

    #[test]
    fn pool_free_never_underflows() {
        let pool = Pool {
            id: "p".into(),
            node: "n".into(),
            capacity: 10,
            used: 20,
        };
        assert_eq!(pool.free(), 0);
    }
}
