//! The storage engine, seen from the control plane.
//!
//! The data plane (replica bdevs, nexus targets, the rebuild machinery) lives
//! on the storage nodes.  The control plane drives it through [`IoEngine`],
//! and every call goes through [`EngineClient`], which bounds it with a
//! timeout and retries calls that failed because the node did not answer.

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::retry::{Retry, bounded};
use crate::types::{ChildRebuild, NexusId, NodeId, PoolId, Protocol, ReplicaId, ReplicaState};

/// Parameters for creating a nexus on a node.
#[derive(Debug, Clone)]
pub struct CreateNexus {
    pub node: NodeId,
    pub uuid: NexusId,
    pub size: u64,
    pub protocol: Protocol,
    /// URIs of the in-sync replicas the nexus starts with.
    pub children: Vec<String>,
    /// Cluster identifier, embedded in the target name.
    pub cluster_id: String,
}

/// Rebuild state of one nexus child as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildProgress {
    pub status: ChildRebuild,
    pub percent: u8,
}

/// Data-plane operations the control plane depends on.
#[async_trait]
pub trait IoEngine: Send + Sync {
    /// Create a replica and return the URI a nexus reaches it by.
    async fn create_replica(
        &self,
        node: &NodeId,
        pool: &PoolId,
        uuid: &ReplicaId,
        size: u64,
    ) -> Result<String, VolumeError>;

    async fn destroy_replica(&self, node: &NodeId, uuid: &ReplicaId) -> Result<(), VolumeError>;

    /// Current health of a replica.
    async fn replica_state(
        &self,
        node: &NodeId,
        uuid: &ReplicaId,
    ) -> Result<ReplicaState, VolumeError>;

    /// Create and share a nexus, returning its device URI.
    async fn create_nexus(&self, request: &CreateNexus) -> Result<String, VolumeError>;

    async fn destroy_nexus(&self, node: &NodeId, uuid: &NexusId) -> Result<(), VolumeError>;

    /// Attach an out-of-sync child; the engine starts rebuilding it at once.
    async fn add_child(&self, node: &NodeId, nexus: &NexusId, uri: &str)
    -> Result<(), VolumeError>;

    async fn remove_child(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<(), VolumeError>;

    async fn rebuild_progress(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<RebuildProgress, VolumeError>;
}

/// An [`IoEngine`] handle whose calls are bounded and retried.
#[derive(Clone)]
pub struct EngineClient {
    engine: Arc<dyn IoEngine>,
    timeout: Duration,
    retry: Retry,
}

impl std::fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineClient")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EngineClient {
    pub fn new(engine: Arc<dyn IoEngine>, timeout: Duration, retry: Retry) -> Self {
        Self {
            engine,
            timeout,
            retry,
        }
    }

    /// Run `call` against the engine, each attempt bounded by the timeout.
    async fn call<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, VolumeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VolumeError>>,
    {
        self.retry.run(|| bounded(op, self.timeout, call())).await
    }

    pub async fn create_replica(
        &self,
        node: &NodeId,
        pool: &PoolId,
        uuid: &ReplicaId,
        size: u64,
    ) -> Result<String, VolumeError> {
        let engine = self.engine.as_ref();
        self.call("create_replica", move || engine.create_replica(node, pool, uuid, size))
            .await
    }

    pub async fn destroy_replica(&self, node: &NodeId, uuid: &ReplicaId) -> Result<(), VolumeError> {
        let engine = self.engine.as_ref();
        self.call("destroy_replica", move || engine.destroy_replica(node, uuid))
            .await
    }

    pub async fn replica_state(
        &self,
        node: &NodeId,
        uuid: &ReplicaId,
    ) -> Result<ReplicaState, VolumeError> {
        let engine = self.engine.as_ref();
        self.call("replica_state", move || engine.replica_state(node, uuid))
            .await
    }

    pub async fn create_nexus(&self, request: &CreateNexus) -> Result<String, VolumeError> {
        let engine = self.engine.as_ref();
        self.call("create_nexus", move || engine.create_nexus(request)).await
    }

    pub async fn destroy_nexus(&self, node: &NodeId, uuid: &NexusId) -> Result<(), VolumeError> {
        let engine = self.engine.as_ref();
        self.call("destroy_nexus", move || engine.destroy_nexus(node, uuid))
            .await
    }

    pub async fn add_child(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<(), VolumeError> {
        let engine = self.engine.as_ref();
        self.call("add_child", move || engine.add_child(node, nexus, uri))
            .await
    }

    pub async fn remove_child(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<(), VolumeError> {
        let engine = self.engine.as_ref();
        self.call("remove_child", move || engine.remove_child(node, nexus, uri))
            .await
    }

    pub async fn rebuild_progress(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<RebuildProgress, VolumeError> {
        let engine = self.engine.as_ref();
        self.call("rebuild_progress", move || engine.rebuild_progress(node, nexus, uri))
            .await
    }
}
