//! In-process [`IoEngine`] for tests and local development.
//!
//! Nodes, replicas and nexuses are plain map entries.  A few knobs let a
//! caller simulate the failures the control plane has to live with: a node
//! that refuses connections, a node that never answers, a replica the engine
//! reports as faulted, and a rebuild that fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use super::{CreateNexus, IoEngine, RebuildProgress};
use crate::error::VolumeError;
use crate::types::{ChildRebuild, NexusId, NodeId, PoolId, Protocol, ReplicaId, ReplicaState};

const NQN_PREFIX: &str = "nqn.2019-05.io.openebs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeHealth {
    Online,
    /// Connections are refused.
    Offline,
    /// Requests are accepted but never answered.
    Stalled,
}

#[derive(Debug, Clone)]
struct EngineReplica {
    node: NodeId,
    state: ReplicaState,
}

#[derive(Debug, Clone)]
struct EngineNexus {
    node: NodeId,
    children: HashMap<String, RebuildProgress>,
}

/// A storage engine that lives entirely in memory.
#[derive(Debug)]
pub struct MemoryEngine {
    nodes: DashMap<NodeId, NodeHealth>,
    replicas: DashMap<ReplicaId, EngineReplica>,
    nexuses: DashMap<NexusId, EngineNexus>,
    /// Percent a rebuild advances on each progress query.
    rebuild_step: AtomicU8,
    /// Child URIs whose next progress query reports a failed rebuild.
    failing: DashSet<String>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            replicas: DashMap::new(),
            nexuses: DashMap::new(),
            rebuild_step: AtomicU8::new(100),
            failing: DashSet::new(),
        }
    }

    /// Add an online node.
    pub fn add_node(&self, node: impl Into<NodeId>) {
        self.nodes.insert(node.into(), NodeHealth::Online);
    }

    /// Bring a node up or take it down.  A down node refuses every call.
    pub fn set_node_online(&self, node: &NodeId, online: bool) {
        let health = if online {
            NodeHealth::Online
        } else {
            NodeHealth::Offline
        };
        self.nodes.insert(node.clone(), health);
    }

    /// Make every call to `node` hang until the caller gives up.
    pub fn stall_node(&self, node: &NodeId) {
        self.nodes.insert(node.clone(), NodeHealth::Stalled);
    }

    /// Override the state the engine reports for a replica.
    pub fn set_replica_state(&self, uuid: &ReplicaId, state: ReplicaState) {
        if let Some(mut replica) = self.replicas.get_mut(uuid) {
            replica.state = state;
        }
    }

    /// Percent each progress query advances a rebuild by; `0` freezes them.
    pub fn set_rebuild_step(&self, percent: u8) {
        self.rebuild_step.store(percent, Ordering::Relaxed);
    }

    /// Fail the rebuild of the child reached through `uri`.
    pub fn fail_rebuild(&self, uri: &str) {
        self.failing.insert(uri.to_owned());
    }

    pub fn has_replica(&self, uuid: &ReplicaId) -> bool {
        self.replicas.contains_key(uuid)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn has_nexus(&self, uuid: &NexusId) -> bool {
        self.nexuses.contains_key(uuid)
    }

    /// Child URIs of a nexus with their rebuild state.
    pub fn nexus_children(&self, uuid: &NexusId) -> Vec<(String, RebuildProgress)> {
        let mut children: Vec<_> = self
            .nexuses
            .get(uuid)
            .map(|n| n.children.iter().map(|(u, p)| (u.clone(), *p)).collect())
            .unwrap_or_default();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    async fn reach(&self, node: &NodeId) -> Result<(), VolumeError> {
        let health = self.nodes.get(node).map(|h| *h);
        match health {
            Some(NodeHealth::Online) => Ok(()),
            Some(NodeHealth::Stalled) => std::future::pending().await,
            Some(NodeHealth::Offline) | None => Err(VolumeError::Unavailable(node.clone())),
        }
    }

    fn nexus_mut(
        &self,
        uuid: &NexusId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, NexusId, EngineNexus>, VolumeError> {
        self.nexuses
            .get_mut(uuid)
            .ok_or_else(|| VolumeError::Engine(format!("nexus {uuid} not found")))
    }
}

#[async_trait]
impl IoEngine for MemoryEngine {
    async fn create_replica(
        &self,
        node: &NodeId,
        pool: &PoolId,
        uuid: &ReplicaId,
        size: u64,
    ) -> Result<String, VolumeError> {
        self.reach(node).await?;
        if size == 0 {
            return Err(VolumeError::engine("replica size must be non-zero"));
        }
        self.replicas.insert(
            *uuid,
            EngineReplica {
                node: node.clone(),
                state: ReplicaState::Online,
            },
        );
        debug!(%node, %pool, replica.uuid = %uuid, "engine created replica");
        Ok(format!("nvmf://{node}:8420/{NQN_PREFIX}:{uuid}"))
    }

    async fn destroy_replica(&self, node: &NodeId, uuid: &ReplicaId) -> Result<(), VolumeError> {
        self.reach(node).await?;
        self.replicas.remove(uuid);
        Ok(())
    }

    async fn replica_state(
        &self,
        node: &NodeId,
        uuid: &ReplicaId,
    ) -> Result<ReplicaState, VolumeError> {
        self.reach(node).await?;
        Ok(self
            .replicas
            .get(uuid)
            .filter(|r| &r.node == node)
            .map(|r| r.state)
            .unwrap_or(ReplicaState::Unknown))
    }

    async fn create_nexus(&self, request: &CreateNexus) -> Result<String, VolumeError> {
        self.reach(&request.node).await?;
        let complete = RebuildProgress {
            status: ChildRebuild::Complete,
            percent: 100,
        };
        self.nexuses.insert(
            request.uuid,
            EngineNexus {
                node: request.node.clone(),
                children: request
                    .children
                    .iter()
                    .map(|uri| (uri.clone(), complete))
                    .collect(),
            },
        );
        let node = &request.node;
        let uuid = request.uuid;
        let uri = match request.protocol {
            Protocol::Nvmf => format!("nvmf://{node}:8420/{NQN_PREFIX}:{}:{uuid}", request.cluster_id),
            Protocol::Iscsi => format!("iscsi://{node}:3260/iqn.2019-05.io.openebs:{uuid}/0"),
            Protocol::Nbd => format!("nbd:///dev/nbd{}", self.nexuses.len() - 1),
        };
        debug!(nexus.uuid = %uuid, %uri, "engine created nexus");
        Ok(uri)
    }

    async fn destroy_nexus(&self, node: &NodeId, uuid: &NexusId) -> Result<(), VolumeError> {
        self.reach(node).await?;
        self.nexuses.remove(uuid);
        Ok(())
    }

    async fn add_child(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<(), VolumeError> {
        self.reach(node).await?;
        let mut entry = self.nexus_mut(nexus)?;
        entry.children.insert(
            uri.to_owned(),
            RebuildProgress {
                status: ChildRebuild::Rebuilding,
                percent: 0,
            },
        );
        Ok(())
    }

    async fn remove_child(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<(), VolumeError> {
        self.reach(node).await?;
        let mut entry = self.nexus_mut(nexus)?;
        entry.children.remove(uri);
        Ok(())
    }

    async fn rebuild_progress(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        uri: &str,
    ) -> Result<RebuildProgress, VolumeError> {
        self.reach(node).await?;
        let step = self.rebuild_step.load(Ordering::Relaxed);
        let failed = self.failing.remove(uri).is_some();
        let mut entry = self.nexus_mut(nexus)?;
        if &entry.node != node {
            return Err(VolumeError::Engine(format!("nexus {nexus} is not on {node}")));
        }
        let progress = entry
            .children
            .get_mut(uri)
            .ok_or_else(|| VolumeError::Engine(format!("child {uri} not in nexus {nexus}")))?;
        if failed {
            progress.status = ChildRebuild::Failed;
        } else if progress.status == ChildRebuild::Rebuilding {
            progress.percent = progress.percent.saturating_add(step).min(100);
            if progress.percent == 100 {
                progress.status = ChildRebuild::Complete;
            }
        }
        Ok(*progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_node_is_unavailable() {
        let engine = MemoryEngine::new();
        let node: NodeId = "n1".into();
        engine.add_node(node.clone());
        let uuid = ReplicaId::new();
        engine
            .create_replica(&node, &"p1".into(), &uuid, 1024)
            .await
            .unwrap();

        engine.set_node_online(&node, false);
        let err = engine.replica_state(&node, &uuid).await.unwrap_err();
        assert_eq!(err, VolumeError::Unavailable(node));
    }

    #[tokio::test]
    async fn rebuild_advances_per_query() {
        let engine = MemoryEngine::new();
        let node: NodeId = "n1".into();
        engine.add_node(node.clone());
        engine.set_rebuild_step(50);
        let nexus = NexusId::new();
        engine
            .create_nexus(&CreateNexus {
                node: node.clone(),
                uuid: nexus,
                size: 1024,
                protocol: Protocol::Nvmf,
                children: vec!["a".into()],
                cluster_id: "c".into(),
            })
            .await
            .unwrap();
        engine.add_child(&node, &nexus, "b").await.unwrap();

        let p = engine.rebuild_progress(&node, &nexus, "b").await.unwrap();
        assert_eq!((p.status, p.percent), (ChildRebuild::Rebuilding, 50));
        let p = engine.rebuild_progress(&node, &nexus, "b").await.unwrap();
        assert_eq!((p.status, p.percent), (ChildRebuild::Complete, 100));
    }

    #[tokio::test]
    async fn injected_rebuild_failure() {
        let engine = MemoryEngine::new();
        let node: NodeId = "n1".into();
        engine.add_node(node.clone());
        engine.set_rebuild_step(10);
        let nexus = NexusId::new();
        engine
            .create_nexus(&CreateNexus {
                node: node.clone(),
                uuid: nexus,
                size: 1024,
                protocol: Protocol::Iscsi,
                children: vec![],
                cluster_id: "c".into(),
            })
            .await
            .unwrap();
        engine.add_child(&node, &nexus, "b").await.unwrap();
        engine.fail_rebuild("b");
        let p = engine.rebuild_progress(&node, &nexus, "b").await.unwrap();
        assert_eq!(p.status, ChildRebuild::Failed);
    }
}
