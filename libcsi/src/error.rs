//! CSI error types.
//!
//! Every node-plugin failure is a [`CsiError`].  The enum derives
//! [`thiserror::Error`], implements [`Serialize`]/[`Deserialize`] so errors
//! travel inside the [`CsiMessage`](crate::message::CsiMessage) envelope, and
//! maps onto the gRPC status codes a CSI front end has to return.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::Code;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// A required field is missing or a value is not acceptable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The path or volume is already bound with different parameters.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The volume is not in the state the operation needs.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The operation is not supported by this plugin.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// A node-level collaborator did not respond in time.  Retryable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The node cannot take more volumes.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The device attach / format machinery returned an error.
    #[error("backend error: {0}")]
    Backend(String),

    /// A socket / transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// An unclassified internal error, also used for conflicting publishes.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::Backend`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    /// Create a [`CsiError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for a missing required request field.
    pub fn missing(field: &str) -> Self {
        Self::InvalidArgument(format!("missing {field}"))
    }

    /// The gRPC status code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::NotFound(_) => Code::NotFound,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::Unavailable(_) | Self::Transport(_) => Code::Unavailable,
            Self::ResourceExhausted(_) => Code::ResourceExhausted,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Backend(_)
            | Self::Internal(_) => Code::Internal,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Transport(_))
    }
}

impl From<CsiError> for tonic::Status {
    fn from(e: CsiError) -> Self {
        tonic::Status::new(e.code(), e.to_string())
    }
}

impl From<std::io::Error> for CsiError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Unavailable(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("volume vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
        assert_eq!(CsiError::missing("volume_id").to_string(), "invalid argument: missing volume_id");
    }

    #[test]
    fn grpc_codes() {
        assert_eq!(CsiError::AlreadyExists("x".into()).code(), Code::AlreadyExists);
        assert_eq!(CsiError::Internal("x".into()).code(), Code::Internal);
        assert_eq!(CsiError::Unimplemented("x".into()).code(), Code::Unimplemented);
        let status: tonic::Status = CsiError::Unavailable("mount timed out".into()).into();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(CsiError::Unavailable("x".into()).is_retryable());
        assert!(!CsiError::InvalidArgument("x".into()).is_retryable());
        assert!(!CsiError::FailedPrecondition("x".into()).is_retryable());
    }

    #[test]
    fn error_travels_as_json() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let de: CsiError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, de);
    }
}
