//! Volume lifecycle orchestration.
//!
//! [`VolumeController`] owns the volume specs and drives the registries, the
//! engine and rebuild admission.  Every operation on a volume holds that
//! volume's lock for its whole duration, so operations on one volume are
//! serialised while different volumes proceed concurrently.
//!
//! Registry updates are applied only after the engine call they describe has
//! succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::CoreConfig;
use crate::engine::{CreateNexus, EngineClient, IoEngine};
use crate::error::VolumeError;
use crate::placement::{Placement, SpreadPlacement};
use crate::rebuild::{RebuildAdmission, RebuildJob, RebuildPermit, RebuildScope};
use crate::registry::Registry;
use crate::types::{
    ChildRebuild, CreateVolume, Nexus, NexusChild, NexusId, NodeId, Pool, Protocol, Replica,
    ReplicaId, ReplicaState, ReplicaTopology, SpecStatus, TargetSpec, Volume, VolumeId,
    VolumeSpec, VolumeState, VolumeStatus,
};

/// Publish-context key carrying the nexus device URI.
pub const CONTEXT_URI: &str = "uri";
/// Publish-context key carrying the I/O timeout in seconds.
pub const CONTEXT_IO_TIMEOUT: &str = "ioTimeout";

type VolumeSlot = Arc<Mutex<VolumeSpec>>;

/// What one reconcile pass did to a volume.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VolumeReconcile {
    pub rebuilds_completed: usize,
    pub rebuilds_failed: usize,
    pub faulted_removed: usize,
    pub replicas_added: usize,
    pub rebuilds_resumed: usize,
    /// Corrective actions that failed and will be retried next tick.
    pub errors: usize,
}

/// Orchestrates volumes across the storage nodes.
#[derive(Debug)]
pub struct VolumeController {
    config: CoreConfig,
    registry: Registry,
    admission: RebuildAdmission,
    engine: EngineClient,
    placement: Arc<dyn Placement>,
    volumes: DashMap<VolumeId, VolumeSlot>,
}

impl VolumeController {
    pub fn new(config: CoreConfig, engine: Arc<dyn IoEngine>) -> Self {
        let admission = RebuildAdmission::new(config.max_rebuilds, config.rebuild_scope);
        let engine = EngineClient::new(engine, config.request_timeout, config.retry());
        Self {
            config,
            registry: Registry::new(),
            admission,
            engine,
            placement: Arc::new(SpreadPlacement),
            volumes: DashMap::new(),
        }
    }

    /// Replace the default placement policy.
    pub fn with_placement(mut self, placement: Arc<dyn Placement>) -> Self {
        self.placement = placement;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn admission(&self) -> &RebuildAdmission {
        &self.admission
    }

    pub fn register_pool(&self, pool: Pool) {
        self.registry.pools.register(pool);
    }

    /// Make a node without pools eligible to host a nexus.
    pub fn register_node(&self, node: impl Into<NodeId>) {
        self.registry.pools.register_node(node.into());
    }

    fn slot(&self, id: &VolumeId) -> Result<VolumeSlot, VolumeError> {
        self.volumes
            .get(id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(VolumeError::VolumeNotFound(*id))
    }

    // -----------------------------------------------------------------------
    // Create / read / delete
    // -----------------------------------------------------------------------

    /// Create a volume and its initial replicas.
    ///
    /// Repeating a create with identical parameters returns the existing
    /// volume.
    #[instrument(skip(self, request), fields(volume.uuid = %request.uuid))]
    pub async fn create_volume(&self, request: CreateVolume) -> Result<Volume, VolumeError> {
        if request.size == 0 {
            return Err(VolumeError::InvalidArgument("volume size must be > 0".into()));
        }
        if request.replicas == 0 {
            return Err(VolumeError::InvalidArgument("replica count must be > 0".into()));
        }

        let slot = Arc::new(Mutex::new(VolumeSpec {
            uuid: request.uuid,
            size: request.size,
            num_replicas: request.replicas,
            policy: request.policy,
            status: SpecStatus::Creating,
            target: None,
        }));
        let mut spec = Arc::clone(&slot)
            .try_lock_owned()
            .map_err(VolumeError::engine)?;
        match self.volumes.entry(request.uuid) {
            Entry::Occupied(entry) => {
                let existing = Arc::clone(entry.get());
                drop(entry);
                let existing = existing.lock().await;
                let same = existing.status == SpecStatus::Created
                    && existing.size == request.size
                    && existing.num_replicas == request.replicas;
                if same {
                    debug!("volume already exists with identical parameters");
                    return Ok(self.view(&existing));
                }
                return Err(VolumeError::AlreadyExists(format!("volume {}", request.uuid)));
            }
            Entry::Vacant(entry) => {
                entry.insert(slot);
            }
        }

        let pools = self.placement.place(
            &self.registry.pools.available(),
            &HashSet::new(),
            request.size,
            usize::from(request.replicas),
        );
        let created = match pools {
            Ok(pools) => {
                self.create_replicas(request.uuid, &pools, request.size, ReplicaState::Online)
                    .await
            }
            Err(error) => Err(error),
        };
        if let Err(error) = created {
            spec.status = SpecStatus::Deleted;
            self.volumes.remove(&request.uuid);
            warn!(%error, "volume creation failed");
            return Err(error);
        }

        spec.status = SpecStatus::Created;
        info!(size = request.size, replicas = request.replicas, "volume created");
        Ok(self.view(&spec))
    }

    /// Spec and derived state of a volume.
    pub async fn get_volume(&self, id: &VolumeId) -> Result<Volume, VolumeError> {
        let slot = self.slot(id)?;
        let spec = slot.lock().await;
        Ok(self.view(&spec))
    }

    /// Every volume, ordered by uuid.
    pub async fn list_volumes(&self) -> Vec<Volume> {
        let mut volumes = Vec::with_capacity(self.volumes.len());
        for slot in self.slots() {
            let spec = slot.lock().await;
            if spec.status != SpecStatus::Deleted {
                volumes.push(self.view(&spec));
            }
        }
        volumes.sort_by_key(|v| v.spec.uuid);
        volumes
    }

    fn slots(&self) -> Vec<VolumeSlot> {
        self.volumes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Ids of every known volume.
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<VolumeId> = self.volumes.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Tear down a volume: its target, then its replicas.
    ///
    /// Replicas whose node cannot be reached are kept as orphans and
    /// collected later by the reconcile loop.
    #[instrument(skip(self), fields(volume.uuid = %id))]
    pub async fn destroy_volume(&self, id: &VolumeId) -> Result<(), VolumeError> {
        let slot = self.slot(id)?;
        let mut spec = slot.lock().await;
        if spec.status == SpecStatus::Deleted {
            return Err(VolumeError::VolumeNotFound(*id));
        }
        spec.status = SpecStatus::Deleting;
        self.detach_locked(&mut spec).await?;
        for replica in self.registry.replicas.by_volume(id) {
            self.admission.release(&replica.uuid);
            self.destroy_or_orphan(&replica).await;
        }
        spec.status = SpecStatus::Deleted;
        self.volumes.remove(id);
        info!("volume destroyed");
        Ok(())
    }

    fn view(&self, spec: &VolumeSpec) -> Volume {
        let replicas = self.registry.replicas.by_volume(&spec.uuid);
        let status = derive_status(spec, &replicas);
        Volume {
            spec: spec.clone(),
            state: VolumeState {
                uuid: spec.uuid,
                size: spec.size,
                status,
                target: self.registry.nexuses.get(&spec.uuid),
                replica_topology: replicas
                    .iter()
                    .map(|r| {
                        let topology = ReplicaTopology {
                            node: r.node.clone(),
                            pool: r.pool.clone(),
                            state: r.state,
                        };
                        (r.uuid, topology)
                    })
                    .collect(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Replica count
    // -----------------------------------------------------------------------

    /// Grow or shrink the volume to `count` replicas.
    ///
    /// Growing needs a rebuild slot for every new replica; if any is refused
    /// nothing is created and the count is left unchanged.  Shrinking is
    /// never gated.
    #[instrument(skip(self), fields(volume.uuid = %id))]
    pub async fn set_replica_count(&self, id: &VolumeId, count: u8) -> Result<Volume, VolumeError> {
        if count == 0 {
            return Err(VolumeError::InvalidArgument("replica count must be > 0".into()));
        }
        let slot = self.slot(id)?;
        let mut spec = slot.lock().await;
        ensure_created(&spec)?;

        let current = spec.num_replicas;
        if count == current {
            debug!(count, "replica count unchanged");
            return Ok(self.view(&spec));
        }

        let replicas = self.registry.replicas.by_volume(id);
        if count > current {
            let live = live_count(&replicas);
            let needed = usize::from(count).saturating_sub(live);
            if needed > 0 {
                self.grow(&spec, needed).await?;
            }
        } else {
            let total = replicas.len();
            let excess = total.saturating_sub(usize::from(count));
            let (removed, failure) = self.shrink(&spec, replicas, excess).await;
            if let Some(error) = failure {
                let remaining = u8::try_from(total - removed).unwrap_or(current);
                spec.num_replicas = remaining.clamp(count, current);
                warn!(%error, removed, replicas = spec.num_replicas, "shrink stopped early");
                return Err(error);
            }
        }
        spec.num_replicas = count;
        info!(from = current, to = count, "replica count changed");
        Ok(self.view(&spec))
    }

    /// Add `needed` replicas to a locked volume.
    async fn grow(&self, spec: &VolumeSpec, needed: usize) -> Result<Vec<ReplicaId>, VolumeError> {
        if self.admission.disabled() {
            warn!(needed, "rebuilds are disabled, refusing to add replicas");
            return Err(VolumeError::RebuildsExhausted {
                scope: RebuildScope::Global,
                limit: 0,
            });
        }

        let existing = self.registry.replicas.by_volume(&spec.uuid);
        let exclude: HashSet<NodeId> = existing.iter().map(|r| r.node.clone()).collect();
        let pools =
            self.placement
                .place(&self.registry.pools.available(), &exclude, spec.size, needed)?;
        let permits = self.admission.try_admit_all(pools.iter().map(|p| &p.node))?;

        let created = self
            .create_replicas(spec.uuid, &pools, spec.size, ReplicaState::Degraded)
            .await?;
        let ids = created.iter().map(|r| r.uuid).collect();

        match self.registry.nexuses.get(&spec.uuid) {
            Some(nexus) => {
                for (replica, permit) in created.iter().zip(permits) {
                    if let Err(error) = self.start_rebuild(&nexus, replica, permit).await {
                        warn!(%error, replica.uuid = %replica.uuid, "rebuild not started, will retry");
                    }
                }
            }
            None => {
                debug!(
                    count = created.len(),
                    "volume not published, new replicas wait for a target"
                );
            }
        }
        Ok(ids)
    }

    /// Remove `excess` replicas, least useful first.
    ///
    /// Every chosen replica leaves the nexus before any is destroyed.  If a
    /// detach fails the shrink stops there: replicas the nexus already let go
    /// of are removed, the rest stay as they were.  Returns how many were
    /// removed and the error that stopped it, if any.
    async fn shrink(
        &self,
        spec: &VolumeSpec,
        mut replicas: Vec<Replica>,
        excess: usize,
    ) -> (usize, Option<VolumeError>) {
        replicas.sort_by_key(|r| (r.state.removal_rank(), std::cmp::Reverse(r.seq)));
        replicas.truncate(excess);

        let mut detached = Vec::with_capacity(replicas.len());
        let mut failure = None;
        for replica in replicas {
            match self.detach_child(spec, &replica).await {
                Ok(left_nexus) => detached.push((replica, left_nexus)),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        if failure.is_some() {
            detached.retain(|(_, left_nexus)| *left_nexus);
        }
        for (replica, _) in &detached {
            self.discard_replica(replica).await;
        }
        (detached.len(), failure)
    }

    /// Reserve space and create replicas on `pools`, rolling back on failure.
    async fn create_replicas(
        &self,
        volume: VolumeId,
        pools: &[Pool],
        size: u64,
        state: ReplicaState,
    ) -> Result<Vec<Replica>, VolumeError> {
        let mut created: Vec<(&Pool, ReplicaId, String)> = Vec::with_capacity(pools.len());
        for pool in pools {
            let uuid = ReplicaId::new();
            let result = match self.registry.pools.reserve(&pool.id, size) {
                Ok(()) => self
                    .engine
                    .create_replica(&pool.node, &pool.id, &uuid, size)
                    .await
                    .inspect_err(|_| self.registry.pools.release(&pool.id, size)),
                Err(error) => Err(error),
            };
            match result {
                Ok(uri) => created.push((pool, uuid, uri)),
                Err(error) => {
                    warn!(%error, pool = %pool.id, "replica creation failed, rolling back");
                    for (pool, uuid, uri) in created {
                        let orphan = new_replica(uuid, None, pool, size, ReplicaState::Unknown, uri);
                        self.destroy_or_orphan(&orphan).await;
                    }
                    return Err(error);
                }
            }
        }

        Ok(created
            .into_iter()
            .map(|(pool, uuid, uri)| {
                let replica = new_replica(uuid, Some(volume), pool, size, state, uri);
                info!(replica.uuid = %uuid, node = %pool.node, pool = %pool.id, "replica created");
                self.registry.replicas.insert(replica)
            })
            .collect())
    }

    /// Destroy a replica on its node; if that fails keep it as an orphan.
    async fn destroy_or_orphan(&self, replica: &Replica) {
        match self.engine.destroy_replica(&replica.node, &replica.uuid).await {
            Ok(()) => {
                self.registry.replicas.remove(&replica.uuid);
                self.registry.pools.release(&replica.pool, replica.size);
                info!(replica.uuid = %replica.uuid, "replica destroyed");
            }
            Err(error) => {
                warn!(%error, replica.uuid = %replica.uuid, "replica destruction failed, orphaning");
                if self.registry.replicas.get(&replica.uuid).is_ok() {
                    self.registry.replicas.disown(&replica.uuid);
                } else {
                    self.registry.replicas.insert(Replica {
                        owner: None,
                        ..replica.clone()
                    });
                }
            }
        }
    }

    /// Detach a replica from the volume's nexus and destroy it.
    async fn remove_replica(&self, spec: &VolumeSpec, replica: &Replica) -> Result<(), VolumeError> {
        self.detach_child(spec, replica).await?;
        self.discard_replica(replica).await;
        Ok(())
    }

    /// Take a replica out of the volume's nexus.  `Ok(true)` when it was a
    /// child and the engine let go of it.
    async fn detach_child(&self, spec: &VolumeSpec, replica: &Replica) -> Result<bool, VolumeError> {
        let Some(nexus) = self.registry.nexuses.get(&spec.uuid) else {
            return Ok(false);
        };
        let Some(child) = nexus.child(&replica.uuid) else {
            return Ok(false);
        };
        self.engine
            .remove_child(&nexus.node, &nexus.uuid, &child.uri)
            .await?;
        self.registry.nexuses.remove_child(&spec.uuid, &replica.uuid);
        Ok(true)
    }

    /// Free the replica's rebuild slot and destroy it.
    async fn discard_replica(&self, replica: &Replica) {
        self.admission.release(&replica.uuid);
        self.destroy_or_orphan(replica).await;
        info!(replica.uuid = %replica.uuid, state = ?replica.state, "replica removed");
    }

    // -----------------------------------------------------------------------
    // Target
    // -----------------------------------------------------------------------

    /// Publish the volume through a nexus on `node`.
    ///
    /// Attaching again with the same node and protocol returns the existing
    /// nexus; anything else while attached is [`VolumeError::AlreadyExists`].
    #[instrument(skip(self), fields(volume.uuid = %id))]
    pub async fn attach_target(
        &self,
        id: &VolumeId,
        node: &NodeId,
        protocol: Protocol,
    ) -> Result<Nexus, VolumeError> {
        let slot = self.slot(id)?;
        let mut spec = slot.lock().await;
        ensure_created(&spec)?;

        if let Some(target) = &spec.target {
            if &target.node == node
                && target.protocol == protocol
                && let Some(nexus) = self.registry.nexuses.get(id)
            {
                debug!("target already attached with identical parameters");
                return Ok(nexus);
            }
            return Err(VolumeError::AlreadyExists(format!(
                "target of volume {id} on {} over {}",
                target.node, target.protocol
            )));
        }
        if !self.registry.pools.node_known(node) {
            return Err(VolumeError::NodeNotFound(node.clone()));
        }

        let healthy: Vec<Replica> = self
            .registry
            .replicas
            .by_volume(id)
            .into_iter()
            .filter(|r| r.state.healthy())
            .collect();
        if healthy.is_empty() {
            return Err(VolumeError::FailedPrecondition(format!(
                "volume {id} has no healthy replica"
            )));
        }

        let request = CreateNexus {
            node: node.clone(),
            uuid: NexusId(id.0),
            size: spec.size,
            protocol,
            children: healthy.iter().map(|r| r.uri.clone()).collect(),
            cluster_id: self.config.cluster_id.clone(),
        };
        let device_uri = self.engine.create_nexus(&request).await?;
        let nexus = Nexus {
            uuid: request.uuid,
            volume: *id,
            node: node.clone(),
            protocol,
            device_uri,
            children: healthy
                .iter()
                .map(|r| NexusChild {
                    replica: r.uuid,
                    uri: r.uri.clone(),
                    rebuild: ChildRebuild::Complete,
                    rebuild_progress: Some(100),
                })
                .collect(),
        };
        self.registry.nexuses.insert(nexus);
        spec.target = Some(TargetSpec {
            node: node.clone(),
            protocol,
        });
        info!(%node, %protocol, "target attached");

        self.resume_rebuilds(&spec).await;
        self.registry
            .nexuses
            .get(id)
            .ok_or_else(|| VolumeError::engine(format!("nexus of volume {id} vanished")))
    }

    /// Unpublish the volume.  A volume without a target is left as is.
    #[instrument(skip(self), fields(volume.uuid = %id))]
    pub async fn detach_target(&self, id: &VolumeId) -> Result<(), VolumeError> {
        let slot = self.slot(id)?;
        let mut spec = slot.lock().await;
        self.detach_locked(&mut spec).await
    }

    async fn detach_locked(&self, spec: &mut VolumeSpec) -> Result<(), VolumeError> {
        if spec.target.is_none() {
            debug!("volume not attached");
            return Ok(());
        }
        if let Some(nexus) = self.registry.nexuses.get(&spec.uuid) {
            self.engine.destroy_nexus(&nexus.node, &nexus.uuid).await?;
            // Interrupted rebuilds leave their replicas Degraded; they resume
            // on the next attach.  Failed and faulted children keep their
            // slots until the replica is removed.
            for child in nexus
                .children
                .iter()
                .filter(|c| c.rebuild == ChildRebuild::Rebuilding)
            {
                self.admission.deregister(&child.replica);
            }
            self.registry.nexuses.remove(&spec.uuid);
        }
        spec.target = None;
        info!(volume.uuid = %spec.uuid, "target detached");
        Ok(())
    }

    /// The context a node plugin needs to stage the published volume.
    pub async fn publish_context(&self, id: &VolumeId) -> Result<HashMap<String, String>, VolumeError> {
        let slot = self.slot(id)?;
        let _spec = slot.lock().await;
        let nexus = self
            .registry
            .nexuses
            .get(id)
            .ok_or_else(|| VolumeError::FailedPrecondition(format!("volume {id} is not published")))?;
        Ok(HashMap::from([
            (CONTEXT_URI.to_owned(), nexus.device_uri),
            (
                CONTEXT_IO_TIMEOUT.to_owned(),
                self.config.io_timeout.as_secs().to_string(),
            ),
        ]))
    }

    // -----------------------------------------------------------------------
    // Faults and rebuilds
    // -----------------------------------------------------------------------

    /// Mark a replica faulted and return the resulting volume status.
    #[instrument(skip(self), fields(replica.uuid = %replica_id))]
    pub async fn mark_replica_faulted(
        &self,
        replica_id: &ReplicaId,
    ) -> Result<VolumeStatus, VolumeError> {
        let owner = self.registry.replicas.get(replica_id)?.owner.ok_or_else(|| {
            VolumeError::FailedPrecondition(format!("replica {replica_id} is orphaned"))
        })?;
        let slot = self.slot(&owner)?;
        let spec = slot.lock().await;
        // Re-read under the lock; the replica may have been removed meanwhile.
        let replica = self.registry.replicas.get(replica_id)?;
        self.fault_replica(&replica);
        Ok(derive_status(&spec, &self.registry.replicas.by_volume(&owner)))
    }

    /// Fault a replica of a locked volume.  While attached to the nexus it
    /// occupies a rebuild slot until removed; a rebuild into it is marked
    /// failed and keeps the slot it already had.
    fn fault_replica(&self, replica: &Replica) {
        if let Ok(previous) = self.registry.replicas.set_state(&replica.uuid, ReplicaState::Faulted)
            && previous != ReplicaState::Faulted
        {
            warn!(replica.uuid = %replica.uuid, node = %replica.node, "replica faulted");
        }
        if let Some(owner) = replica.owner
            && let Some(nexus) = self.registry.nexuses.get(&owner)
            && let Some(child) = nexus.child(&replica.uuid)
        {
            if child.rebuild == ChildRebuild::Rebuilding {
                self.registry.nexuses.set_rebuild(
                    &owner,
                    &replica.uuid,
                    ChildRebuild::Failed,
                    child.rebuild_progress,
                );
            }
            self.admission
                .hold_faulted(replica.uuid, self.admission.scope_for(&replica.node));
        }
    }

    /// Attach an out-of-sync replica to the nexus and record the rebuild.
    async fn start_rebuild(
        &self,
        nexus: &Nexus,
        replica: &Replica,
        permit: RebuildPermit,
    ) -> Result<(), VolumeError> {
        self.engine
            .add_child(&nexus.node, &nexus.uuid, &replica.uri)
            .await?;
        self.registry.nexuses.add_child(
            &nexus.volume,
            NexusChild {
                replica: replica.uuid,
                uri: replica.uri.clone(),
                rebuild: ChildRebuild::Rebuilding,
                rebuild_progress: Some(0),
            },
        );
        let source = nexus
            .children
            .iter()
            .find(|c| c.rebuild == ChildRebuild::Complete)
            .map(|c| c.replica);
        self.admission.register(RebuildJob::new(
            permit,
            nexus.volume,
            nexus.uuid,
            source,
            replica.uuid,
        ));
        Ok(())
    }

    /// Start rebuilds for Degraded replicas not yet attached to the nexus.
    async fn resume_rebuilds(&self, spec: &VolumeSpec) -> usize {
        let Some(nexus) = self.registry.nexuses.get(&spec.uuid) else {
            return 0;
        };
        let pending: Vec<Replica> = self
            .registry
            .replicas
            .by_volume(&spec.uuid)
            .into_iter()
            .filter(|r| r.state == ReplicaState::Degraded && nexus.child(&r.uuid).is_none())
            .collect();

        let mut started = 0;
        for replica in pending {
            let permit = match self.admission.try_admit(self.admission.scope_for(&replica.node)) {
                Ok(permit) => permit,
                Err(error) => {
                    warn!(%error, replica.uuid = %replica.uuid, "rebuild deferred");
                    continue;
                }
            };
            match self.start_rebuild(&nexus, &replica, permit).await {
                Ok(()) => started += 1,
                Err(error) => {
                    warn!(%error, replica.uuid = %replica.uuid, "rebuild not started, will retry");
                }
            }
        }
        started
    }

    /// Poll the engine for the rebuilds of a locked volume.
    async fn poll_rebuilds(&self, spec: &VolumeSpec, report: &mut VolumeReconcile) {
        let Some(nexus) = self.registry.nexuses.get(&spec.uuid) else {
            return;
        };
        for child in nexus
            .children
            .iter()
            .filter(|c| c.rebuild == ChildRebuild::Rebuilding)
        {
            let progress = match self
                .engine
                .rebuild_progress(&nexus.node, &nexus.uuid, &child.uri)
                .await
            {
                Ok(progress) => progress,
                Err(error) => {
                    warn!(%error, replica.uuid = %child.replica, "rebuild progress unavailable");
                    report.errors += 1;
                    continue;
                }
            };
            match progress.status {
                ChildRebuild::Complete => {
                    // The replica may already have been faulted by a health refresh.
                    if let Ok(ReplicaState::Degraded) = self
                        .registry
                        .replicas
                        .get(&child.replica)
                        .map(|r| r.state)
                    {
                        let _ = self
                            .registry
                            .replicas
                            .set_state(&child.replica, ReplicaState::Online);
                    }
                    self.registry.nexuses.set_rebuild(
                        &spec.uuid,
                        &child.replica,
                        ChildRebuild::Complete,
                        Some(100),
                    );
                    self.admission.deregister(&child.replica);
                    report.rebuilds_completed += 1;
                }
                ChildRebuild::Failed => {
                    if let Ok(replica) = self.registry.replicas.get(&child.replica) {
                        self.fault_replica(&replica);
                    }
                    report.rebuilds_failed += 1;
                }
                ChildRebuild::Rebuilding | ChildRebuild::NotStarted => {
                    self.registry.nexuses.set_rebuild(
                        &spec.uuid,
                        &child.replica,
                        progress.status,
                        Some(progress.percent),
                    );
                    self.admission
                        .update_progress(&child.replica, progress.percent);
                }
            }
        }
    }

    /// Remove faulted replicas past the grace period, as long as a healthy
    /// replica remains to serve the data.
    async fn remove_expired(&self, spec: &VolumeSpec, report: &mut VolumeReconcile) {
        let replicas = self.registry.replicas.by_volume(&spec.uuid);
        if !replicas.iter().any(|r| r.state.healthy()) {
            if replicas.iter().any(|r| r.state == ReplicaState::Faulted) {
                warn!(volume.uuid = %spec.uuid, "no healthy replica, keeping faulted replicas");
            }
            return;
        }
        let grace = self.config.faulted_grace_period;
        let now = Instant::now();
        for replica in replicas.iter().filter(|r| {
            r.state == ReplicaState::Faulted
                && r.faulted_at.is_some_and(|at| now.duration_since(at) >= grace)
        }) {
            match self.remove_replica(spec, replica).await {
                Ok(()) => report.faulted_removed += 1,
                Err(error) => {
                    warn!(%error, replica.uuid = %replica.uuid, "faulted replica not removed");
                    report.errors += 1;
                }
            }
        }
    }

    /// One reconcile pass over a volume.  Each step's failure is logged and
    /// left for the next tick.
    #[instrument(skip(self), fields(volume.uuid = %id))]
    pub(crate) async fn reconcile_volume(&self, id: &VolumeId) -> VolumeReconcile {
        let mut report = VolumeReconcile::default();
        let Ok(slot) = self.slot(id) else {
            return report;
        };
        let spec = slot.lock().await;
        if spec.status != SpecStatus::Created {
            return report;
        }

        self.poll_rebuilds(&spec, &mut report).await;
        self.remove_expired(&spec, &mut report).await;

        let replicas = self.registry.replicas.by_volume(id);
        let needed = usize::from(spec.num_replicas).saturating_sub(live_count(&replicas));
        if needed > 0 {
            match self.grow(&spec, needed).await {
                Ok(added) => report.replicas_added += added.len(),
                Err(error) => {
                    if error.is_retryable() {
                        warn!(%error, needed, "volume under-replicated, will retry");
                    } else {
                        warn!(%error, needed, "failed to restore replica count");
                    }
                    report.errors += 1;
                }
            }
        }

        report.rebuilds_resumed += self.resume_rebuilds(&spec).await;
        report
    }

    /// Query replica health from the engine; an unreachable node faults
    /// every replica it hosts.  Returns the number of replicas faulted.
    pub(crate) async fn refresh_health(&self) -> usize {
        let mut node_down: HashMap<NodeId, bool> = HashMap::new();
        let mut to_fault: Vec<Replica> = Vec::new();

        for replica in self.registry.replicas.owned() {
            if replica.state == ReplicaState::Faulted {
                continue;
            }
            if node_down.get(&replica.node) == Some(&true) {
                to_fault.push(replica);
                continue;
            }
            match self.engine.replica_state(&replica.node, &replica.uuid).await {
                Ok(state) => {
                    node_down.insert(replica.node.clone(), false);
                    if state == ReplicaState::Faulted {
                        to_fault.push(replica);
                    }
                }
                Err(error) if error.is_unreachable() => {
                    warn!(%error, node = %replica.node, "node unreachable");
                    node_down.insert(replica.node.clone(), true);
                    to_fault.push(replica);
                }
                Err(error) => {
                    warn!(%error, replica.uuid = %replica.uuid, "replica health query failed");
                }
            }
        }

        for (node, down) in &node_down {
            self.registry.pools.set_reachable(node, !down);
        }

        let mut faulted = 0;
        for replica in to_fault {
            let Some(owner) = replica.owner else { continue };
            let Ok(slot) = self.slot(&owner) else { continue };
            let _spec = slot.lock().await;
            if let Ok(current) = self.registry.replicas.get(&replica.uuid)
                && current.state != ReplicaState::Faulted
            {
                self.fault_replica(&current);
                faulted += 1;
            }
        }
        faulted
    }

    /// Retry destroying orphaned replicas.  Returns how many were collected.
    pub(crate) async fn collect_orphans(&self) -> usize {
        let mut collected = 0;
        for orphan in self.registry.replicas.orphans() {
            match self.engine.destroy_replica(&orphan.node, &orphan.uuid).await {
                Ok(()) => {
                    self.registry.replicas.remove(&orphan.uuid);
                    self.registry.pools.release(&orphan.pool, orphan.size);
                    info!(replica.uuid = %orphan.uuid, "orphaned replica collected");
                    collected += 1;
                }
                Err(error) => {
                    debug!(%error, replica.uuid = %orphan.uuid, "orphan still unreachable");
                }
            }
        }
        collected
    }
}

fn ensure_created(spec: &VolumeSpec) -> Result<(), VolumeError> {
    if spec.status != SpecStatus::Created {
        return Err(VolumeError::FailedPrecondition(format!(
            "volume {} is {:?}",
            spec.uuid, spec.status
        )));
    }
    Ok(())
}

/// Replicas that are not faulted; those count towards the requested total.
fn live_count(replicas: &[Replica]) -> usize {
    replicas
        .iter()
        .filter(|r| r.state != ReplicaState::Faulted)
        .count()
}

fn new_replica(
    uuid: ReplicaId,
    owner: Option<VolumeId>,
    pool: &Pool,
    size: u64,
    state: ReplicaState,
    uri: String,
) -> Replica {
    Replica {
        uuid,
        owner,
        node: pool.node.clone(),
        pool: pool.id.clone(),
        size,
        state,
        uri,
        seq: 0,
        faulted_at: None,
    }
}

/// Volume status from the health of its replicas.
pub fn derive_status(spec: &VolumeSpec, replicas: &[Replica]) -> VolumeStatus {
    if spec.status != SpecStatus::Created {
        return VolumeStatus::Unknown;
    }
    let healthy = replicas.iter().filter(|r| r.state.healthy()).count();
    if healthy == 0 {
        VolumeStatus::Faulted
    } else if healthy >= usize::from(spec.num_replicas) && healthy == replicas.len() {
        VolumeStatus::Online
    } else {
        VolumeStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::rebuild::RebuildDomain;

    fn config(max_rebuilds: Option<u32>) -> CoreConfig {
        CoreConfig {
            max_rebuilds,
            request_timeout: Duration::from_millis(50),
            request_retries: 2,
            retry_interval: Duration::from_millis(1),
            ..CoreConfig::default()
        }
    }

    fn fixture(config: CoreConfig, nodes: usize) -> (Arc<MemoryEngine>, VolumeController) {
        let engine = Arc::new(MemoryEngine::new());
        let controller = VolumeController::new(config, engine.clone());
        for i in 1..=nodes {
            let node = format!("node-{i}");
            engine.add_node(node.as_str());
            controller.register_pool(Pool {
                id: format!("pool-{i}").into(),
                node: node.into(),
                capacity: 1 << 30,
                used: 0,
            });
        }
        (engine, controller)
    }

    async fn create(controller: &VolumeController, replicas: u8) -> VolumeId {
        let uuid = VolumeId::new();
        controller
            .create_volume(CreateVolume {
                uuid,
                size: 1 << 20,
                replicas,
                policy: Default::default(),
            })
            .await
            .unwrap();
        uuid
    }

    fn first_replica(controller: &VolumeController, id: &VolumeId) -> ReplicaId {
        controller.registry().replicas.by_volume(id)[0].uuid
    }

    #[tokio::test]
    async fn create_is_idempotent_and_conflicts_on_change() {
        let (_, controller) = fixture(config(None), 3);
        let uuid = create(&controller, 2).await;
        let volume = controller.get_volume(&uuid).await.unwrap();
        assert_eq!(volume.state.status, VolumeStatus::Online);
        assert_eq!(volume.state.replica_topology.len(), 2);

        let again = controller
            .create_volume(CreateVolume {
                uuid,
                size: 1 << 20,
                replicas: 2,
                policy: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(again.state.replica_topology.len(), 2);

        let err = controller
            .create_volume(CreateVolume {
                uuid,
                size: 2 << 20,
                replicas: 2,
                policy: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_without_enough_pools_leaves_nothing() {
        let (engine, controller) = fixture(config(None), 2);
        let err = controller
            .create_volume(CreateVolume {
                uuid: VolumeId::new(),
                size: 1 << 20,
                replicas: 3,
                policy: Default::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code().as_u16(), 507);
        assert!(controller.list_volumes().await.is_empty());
        assert_eq!(engine.replica_count(), 0);
    }

    #[tokio::test]
    async fn zero_cap_refuses_growth() {
        let (engine, controller) = fixture(config(Some(0)), 3);
        let uuid = create(&controller, 2).await;
        let faulted = first_replica(&controller, &uuid);
        let status = controller.mark_replica_faulted(&faulted).await.unwrap();
        assert_eq!(status, VolumeStatus::Degraded);

        let err = controller.set_replica_count(&uuid, 3).await.unwrap_err();
        assert!(matches!(err, VolumeError::RebuildsExhausted { limit: 0, .. }));
        assert_eq!(err.status_code().as_u16(), 507);

        let volume = controller.get_volume(&uuid).await.unwrap();
        assert_eq!(volume.spec.num_replicas, 2);
        assert_eq!(volume.state.replica_topology.len(), 2);
        assert_eq!(engine.replica_count(), 2);
    }

    #[tokio::test]
    async fn growth_is_all_or_nothing_under_cap() {
        let (engine, controller) = fixture(config(Some(1)), 4);
        let uuid = create(&controller, 1).await;
        let err = controller.set_replica_count(&uuid, 3).await.unwrap_err();
        assert!(matches!(err, VolumeError::RebuildsExhausted { limit: 1, .. }));
        assert_eq!(engine.replica_count(), 1);
        assert_eq!(controller.admission().active(&RebuildScope::Global), 0);

        let volume = controller.set_replica_count(&uuid, 2).await.unwrap();
        assert_eq!(volume.spec.num_replicas, 2);
        assert_eq!(volume.state.status, VolumeStatus::Degraded);
    }

    #[tokio::test]
    async fn concurrent_growth_respects_single_slot() {
        let (engine, controller) = fixture(config(Some(1)), 5);
        let controller = Arc::new(controller);
        let a = create(&controller, 1).await;
        let b = create(&controller, 1).await;
        for id in [a, b] {
            controller
                .attach_target(&id, &"node-1".into(), Protocol::Nvmf)
                .await
                .unwrap();
        }
        engine.set_rebuild_step(0);

        let (ra, rb) = tokio::join!(
            controller.set_replica_count(&a, 2),
            controller.set_replica_count(&b, 2)
        );
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        assert_eq!(controller.admission().job_count(), 1);
        assert_eq!(controller.admission().active(&RebuildScope::Global), 1);
    }

    #[tokio::test]
    async fn published_growth_rebuilds_to_online() {
        let (_, controller) = fixture(config(Some(2)), 3);
        let uuid = create(&controller, 1).await;
        controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        controller.set_replica_count(&uuid, 2).await.unwrap();
        assert_eq!(controller.admission().job_count(), 1);

        let report = controller.reconcile_volume(&uuid).await;
        assert_eq!(report.rebuilds_completed, 1);
        assert_eq!(controller.admission().job_count(), 0);

        let volume = controller.get_volume(&uuid).await.unwrap();
        assert_eq!(volume.state.status, VolumeStatus::Online);
        let nexus = volume.state.target.unwrap();
        assert!(nexus.children.iter().all(|c| c.rebuild == ChildRebuild::Complete));
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_slot_until_removal() {
        let mut cfg = config(Some(1));
        cfg.faulted_grace_period = Duration::from_secs(3600);
        let (engine, controller) = fixture(cfg, 3);
        let uuid = create(&controller, 1).await;
        controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        engine.set_rebuild_step(10);
        controller.set_replica_count(&uuid, 2).await.unwrap();

        let new = controller
            .registry()
            .replicas
            .by_volume(&uuid)
            .into_iter()
            .find(|r| r.state == ReplicaState::Degraded)
            .unwrap();
        engine.fail_rebuild(&new.uri);
        let report = controller.reconcile_volume(&uuid).await;
        assert_eq!(report.rebuilds_failed, 1);
        assert_eq!(controller.admission().active(&RebuildScope::Global), 1);
        assert_eq!(
            controller.registry().replicas.get(&new.uuid).unwrap().state,
            ReplicaState::Faulted
        );

        controller.set_replica_count(&uuid, 1).await.unwrap();
        assert_eq!(controller.admission().active(&RebuildScope::Global), 0);
        assert!(!engine.has_replica(&new.uuid));
    }

    #[tokio::test]
    async fn faulted_child_holds_a_slot_until_removed() {
        let (_, controller) = fixture(config(Some(1)), 5);
        let a = create(&controller, 2).await;
        controller
            .attach_target(&a, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        let faulted = controller.registry().replicas.by_volume(&a)[1].uuid;
        controller.mark_replica_faulted(&faulted).await.unwrap();
        assert!(controller.admission().is_held(&faulted));
        assert_eq!(controller.admission().active(&RebuildScope::Global), 1);

        let b = create(&controller, 1).await;
        let err = controller.set_replica_count(&b, 2).await.unwrap_err();
        assert!(matches!(err, VolumeError::RebuildsExhausted { limit: 1, .. }));

        // Detaching does not give the slot back; removing the replica does.
        controller.detach_target(&a).await.unwrap();
        assert_eq!(controller.admission().active(&RebuildScope::Global), 1);
        controller.set_replica_count(&a, 1).await.unwrap();
        assert!(!controller.admission().is_held(&faulted));
        assert_eq!(controller.admission().active(&RebuildScope::Global), 0);

        controller.set_replica_count(&b, 2).await.unwrap();
    }

    #[tokio::test]
    async fn lost_node_child_is_owed_a_slot() {
        let (engine, controller) = fixture(config(Some(1)), 3);
        engine.set_rebuild_step(0);
        let uuid = create(&controller, 2).await;
        controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        controller.set_replica_count(&uuid, 3).await.unwrap();
        assert_eq!(controller.admission().active(&RebuildScope::Global), 1);

        let lost = controller
            .registry()
            .replicas
            .by_volume(&uuid)
            .into_iter()
            .find(|r| r.state == ReplicaState::Online && r.node.as_str() != "node-1")
            .unwrap();
        engine.set_node_online(&lost.node, false);
        assert_eq!(controller.refresh_health().await, 1);
        assert!(controller.admission().is_held(&lost.uuid));
        assert_eq!(controller.admission().active(&RebuildScope::Global), 2);
        assert!(controller.admission().try_admit(RebuildScope::Global).is_err());
    }

    #[tokio::test]
    async fn shrink_with_unreachable_nexus_removes_nothing() {
        let (engine, controller) = fixture(config(Some(1)), 3);
        engine.add_node("node-x");
        controller.register_node("node-x");
        let uuid = create(&controller, 1).await;
        controller.set_replica_count(&uuid, 2).await.unwrap();
        controller.set_replica_count(&uuid, 3).await.unwrap();
        engine.set_rebuild_step(0);
        controller
            .attach_target(&uuid, &"node-x".into(), Protocol::Nvmf)
            .await
            .unwrap();
        engine.set_node_online(&"node-x".into(), false);

        let err = controller.set_replica_count(&uuid, 1).await.unwrap_err();
        assert!(err.is_retryable());
        let volume = controller.get_volume(&uuid).await.unwrap();
        assert_eq!(volume.spec.num_replicas, 3);
        assert_eq!(volume.state.replica_topology.len(), 3);
        assert_eq!(engine.replica_count(), 3);
    }

    #[tokio::test]
    async fn shrink_removes_faulted_then_newest() {
        let (_, controller) = fixture(config(None), 4);
        let uuid = create(&controller, 3).await;
        let replicas = controller.registry().replicas.by_volume(&uuid);
        controller.mark_replica_faulted(&replicas[1].uuid).await.unwrap();

        controller.set_replica_count(&uuid, 2).await.unwrap();
        let left: Vec<_> = controller
            .registry()
            .replicas
            .by_volume(&uuid)
            .iter()
            .map(|r| r.uuid)
            .collect();
        assert_eq!(left, vec![replicas[0].uuid, replicas[2].uuid]);

        controller.set_replica_count(&uuid, 1).await.unwrap();
        let left = controller.registry().replicas.by_volume(&uuid);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].uuid, replicas[0].uuid);
    }

    #[tokio::test]
    async fn replica_count_validation() {
        let (_, controller) = fixture(config(None), 2);
        let uuid = create(&controller, 1).await;
        assert!(matches!(
            controller.set_replica_count(&uuid, 0).await,
            Err(VolumeError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.set_replica_count(&VolumeId::new(), 2).await,
            Err(VolumeError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn attach_is_idempotent_and_exclusive() {
        let (_, controller) = fixture(config(None), 2);
        let uuid = create(&controller, 1).await;
        let node: NodeId = "node-1".into();
        let first = controller
            .attach_target(&uuid, &node, Protocol::Nvmf)
            .await
            .unwrap();
        assert!(first.device_uri.starts_with("nvmf://node-1"));
        let second = controller
            .attach_target(&uuid, &node, Protocol::Nvmf)
            .await
            .unwrap();
        assert_eq!(first, second);

        let err = controller
            .attach_target(&uuid, &node, Protocol::Iscsi)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::AlreadyExists(_)));
        let err = controller
            .attach_target(&uuid, &"node-2".into(), Protocol::Nvmf)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::AlreadyExists(_)));

        let context = controller.publish_context(&uuid).await.unwrap();
        assert_eq!(context[CONTEXT_URI], first.device_uri);
        assert_eq!(context[CONTEXT_IO_TIMEOUT], "30");
    }

    #[tokio::test]
    async fn attach_to_unknown_node() {
        let (_, controller) = fixture(config(None), 1);
        let uuid = create(&controller, 1).await;
        let err = controller
            .attach_target(&uuid, &"elsewhere".into(), Protocol::Nvmf)
            .await
            .unwrap_err();
        assert_eq!(err, VolumeError::NodeNotFound("elsewhere".into()));
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let (engine, controller) = fixture(config(None), 1);
        let uuid = create(&controller, 1).await;
        controller.detach_target(&uuid).await.unwrap();

        let nexus = controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nbd)
            .await
            .unwrap();
        controller.detach_target(&uuid).await.unwrap();
        controller.detach_target(&uuid).await.unwrap();
        assert!(!engine.has_nexus(&nexus.uuid));
        assert!(controller.get_volume(&uuid).await.unwrap().state.target.is_none());
        assert!(matches!(
            controller.publish_context(&uuid).await,
            Err(VolumeError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn unpublished_replicas_resume_on_attach() {
        let (_, controller) = fixture(config(Some(1)), 3);
        let uuid = create(&controller, 1).await;
        controller.set_replica_count(&uuid, 2).await.unwrap();
        assert_eq!(controller.admission().job_count(), 0);

        let nexus = controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        assert_eq!(nexus.children.len(), 2);
        assert_eq!(controller.admission().job_count(), 1);
    }

    #[tokio::test]
    async fn fault_status_derivation() {
        let (_, controller) = fixture(config(None), 2);
        let uuid = create(&controller, 2).await;
        let replicas = controller.registry().replicas.by_volume(&uuid);
        assert_eq!(
            controller.mark_replica_faulted(&replicas[0].uuid).await.unwrap(),
            VolumeStatus::Degraded
        );
        assert_eq!(
            controller.mark_replica_faulted(&replicas[1].uuid).await.unwrap(),
            VolumeStatus::Faulted
        );
    }

    #[tokio::test]
    async fn destroy_orphans_unreachable_replicas() {
        let (engine, controller) = fixture(config(None), 2);
        let uuid = create(&controller, 2).await;
        controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        engine.set_node_online(&"node-2".into(), false);

        controller.destroy_volume(&uuid).await.unwrap();
        assert!(matches!(
            controller.get_volume(&uuid).await,
            Err(VolumeError::VolumeNotFound(_))
        ));
        assert_eq!(controller.registry().replicas.orphans().len(), 1);

        assert_eq!(controller.collect_orphans().await, 0);
        engine.set_node_online(&"node-2".into(), true);
        assert_eq!(controller.collect_orphans().await, 1);
        assert!(controller.registry().replicas.is_empty());
        assert_eq!(engine.replica_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_node_faults_its_replicas() {
        let (engine, controller) = fixture(config(None), 2);
        let uuid = create(&controller, 2).await;
        engine.stall_node(&"node-2".into());

        assert_eq!(controller.refresh_health().await, 1);
        assert!(!controller.registry().pools.reachable(&"node-2".into()));
        let volume = controller.get_volume(&uuid).await.unwrap();
        assert_eq!(volume.state.status, VolumeStatus::Degraded);
    }

    #[tokio::test]
    async fn per_node_scope_limits_each_node() {
        let mut cfg = config(Some(1));
        cfg.rebuild_scope = RebuildDomain::PerNode;
        let (engine, controller) = fixture(cfg, 3);
        engine.set_rebuild_step(0);
        let uuid = create(&controller, 1).await;
        controller
            .attach_target(&uuid, &"node-1".into(), Protocol::Nvmf)
            .await
            .unwrap();
        controller.set_replica_count(&uuid, 3).await.unwrap();
        assert_eq!(controller.admission().job_count(), 2);
    }
}
