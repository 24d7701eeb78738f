//! # libvolume: replicated volume control plane
//!
//! `libvolume` orchestrates volumes whose data is replicated across storage
//! nodes and published through a nexus (an aggregation block target spoken
//! to over NVMe-oF, iSCSI or NBD).  It decides where replicas live, keeps the
//! replica count at what was requested, and caps how many full resyncs
//! ("rebuilds") may run at once so that recovery never swamps node I/O.
//!
//! The data plane is reached through the [`engine::IoEngine`] trait; the
//! crate ships an in-memory engine for tests and local development.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: volumes, replicas, nexuses, pools and their ids. |
//! | [`error`] | [`VolumeError`] and its REST status mapping. |
//! | [`registry`] | Replica, nexus and pool registries. |
//! | [`rebuild`] | [`RebuildAdmission`]: atomic admission and active rebuild jobs. |
//! | [`placement`] | Pluggable replica placement. |
//! | [`engine`] | [`IoEngine`] collaborator trait, bounded client, memory engine. |
//! | [`controller`] | [`VolumeController`]: create, attach, replica count, faults. |
//! | [`reconcile`] | [`ReconcileLoop`]: periodic drift correction. |
//! | [`retry`] | Bounded retry and timeout helpers. |
//! | [`config`] | [`CoreConfig`] with environment overrides. |

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod placement;
pub mod rebuild;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod types;

pub use config::CoreConfig;
pub use controller::VolumeController;
pub use engine::IoEngine;
pub use error::VolumeError;
pub use rebuild::RebuildAdmission;
pub use reconcile::ReconcileLoop;
pub use types::*;
