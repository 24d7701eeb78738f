//! In-memory registries for the entities the control plane owns.
//!
//! Each registry is owned state behind concurrent maps, reached only through
//! its methods.  Cross-entity consistency (a replica and the nexus child that
//! points at it) is the job of the `VolumeController`, which serialises work
//! per volume before touching more than one registry.

mod nexus;
mod pool;
mod replica;

pub use nexus::NexusRegistry;
pub use pool::PoolRegistry;
pub use replica::ReplicaRegistry;

/// The three registries bundled together.
#[derive(Debug, Default)]
pub struct Registry {
    pub replicas: ReplicaRegistry,
    pub nexuses: NexusRegistry,
    pub pools: PoolRegistry,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
}
