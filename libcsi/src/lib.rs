//! # libcsi: CSI node plugin for replicated block volumes
//!
//! `libcsi` implements the node half of the [Container Storage Interface][csi]
//! for volumes exported as NVMe-oF, iSCSI or NBD targets.  Requests travel as
//! JSON over a local Unix socket; the shapes follow the CSI node-plugin
//! schema and errors map onto gRPC status codes.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Capabilities, node requests, plugin and node info. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope for the socket transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`uri`] | Device URIs carried in the publish context. |
//! | [`lock`] | Per-key async locks. |
//! | [`state`] | Explicit per-volume node state. |
//! | [`table`] | Staging and publish tables. |
//! | [`service`] | [`CsiNodeService`], the plugin itself. |
//! | [`backend`] | Host collaborators: device attach and mounts. |
//! | [`transport`] | Unix-socket client/server. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod node;
pub mod service;
pub mod state;
pub mod table;
pub mod transport;
pub mod types;
pub mod uri;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::NodeBackend;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use service::{CsiNodeService, NodeServiceConfig};
pub use types::*;
