//! Control-plane error types.
//!
//! Every fallible control-plane operation returns [`VolumeError`].  The enum
//! knows which REST status code it surfaces as and whether the reconcile loop
//! should try again on a later tick.

use http::StatusCode;
use thiserror::Error;

use crate::rebuild::RebuildScope;
use crate::types::{NodeId, ReplicaId, VolumeId};

/// Unified error type for volume operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The volume does not exist.
    #[error("volume {0} not found")]
    VolumeNotFound(VolumeId),

    /// The replica does not exist.
    #[error("replica {0} not found")]
    ReplicaNotFound(ReplicaId),

    /// The node is not known to the control plane.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The resource exists with different parameters.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Admission control refused to start another rebuild.
    #[error("rebuild limit of {limit} reached for scope {scope}")]
    RebuildsExhausted {
        /// Concurrency domain that is full.
        scope: RebuildScope,
        /// Configured cap.
        limit: u32,
    },

    /// Not enough pools to place the requested replicas.
    #[error("not enough suitable pools: needed {needed}, found {found}")]
    NoSuitablePools {
        /// Pools required.
        needed: usize,
        /// Pools that qualified.
        found: usize,
    },

    /// The operation requires a state the resource is not in.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An engine call did not answer in time.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Operation that was abandoned.
        op: String,
        /// Bound that expired.
        after: std::time::Duration,
    },

    /// The storage node could not be reached.
    #[error("node {0} unavailable")]
    Unavailable(NodeId),

    /// The storage engine rejected the request.
    #[error("engine error: {0}")]
    Engine(String),
}

impl VolumeError {
    /// Create a [`VolumeError::Engine`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn engine<E: std::fmt::Display>(e: E) -> Self {
        Self::Engine(e.to_string())
    }

    /// The REST status code this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::VolumeNotFound(_) | Self::ReplicaNotFound(_) | Self::NodeNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::RebuildsExhausted { .. } | Self::NoSuitablePools { .. } => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::Timeout { .. } | Self::Unavailable(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Unavailable(_)
                | Self::RebuildsExhausted { .. }
                | Self::NoSuitablePools { .. }
        )
    }

    /// Whether the error means the storage node did not respond.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}
