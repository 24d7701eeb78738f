//! Rebuild admission control.
//!
//! A rebuild is a full resync of a replica from a healthy peer and is the
//! most I/O-hungry thing the control plane can ask a node to do.  The
//! [`RebuildAdmission`] controller caps how many of them run at once.
//!
//! Admission is a single atomic step: the slot counter for a scope is checked
//! and incremented under the same map-shard lock, and the returned
//! [`RebuildPermit`] gives the slot back when dropped.  A request past the cap
//! is rejected outright; nothing is ever queued.
//!
//! A replica that faults while attached to a nexus keeps a slot until it is
//! removed, whether or not it was rebuilding.  When the scope is already full
//! that slot is owed: the count goes over the cap and new admissions are
//! refused until enough slots are released.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::VolumeError;
use crate::types::{NexusId, NodeId, ReplicaId, VolumeId};

/// How rebuild slots are partitioned.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildDomain {
    /// One pool of slots shared by the whole cluster.
    #[default]
    Global,
    /// Separate slots for every node hosting a rebuilding replica.
    PerNode,
}

impl FromStr for RebuildDomain {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "per-node" => Ok(Self::PerNode),
            other => Err(VolumeError::InvalidArgument(format!(
                "unknown rebuild scope '{other}', expected 'global' or 'per-node'"
            ))),
        }
    }
}

/// The concurrency domain a single rebuild is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebuildScope {
    Global,
    Node(NodeId),
}

impl fmt::Display for RebuildScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Node(node) => write!(f, "node/{node}"),
        }
    }
}

/// A held rebuild slot.  Dropping it frees the slot.
#[derive(Debug)]
pub struct RebuildPermit {
    scope: RebuildScope,
    active: Arc<DashMap<RebuildScope, u32>>,
}

impl RebuildPermit {
    /// Scope this permit was admitted under.
    pub fn scope(&self) -> &RebuildScope {
        &self.scope
    }
}

impl Drop for RebuildPermit {
    fn drop(&mut self) {
        if let Some(mut count) = self.active.get_mut(&self.scope) {
            *count = count.saturating_sub(1);
        }
        debug!(scope = %self.scope, "rebuild slot released");
    }
}

/// An active resync of `target` from `source` through a nexus.
#[derive(Debug)]
pub struct RebuildJob {
    pub volume: VolumeId,
    pub nexus: NexusId,
    pub source: Option<ReplicaId>,
    pub target: ReplicaId,
    pub started: Instant,
    pub progress: u8,
    permit: RebuildPermit,
}

impl RebuildJob {
    /// Bind an admitted permit to the rebuild it pays for.
    pub fn new(
        permit: RebuildPermit,
        volume: VolumeId,
        nexus: NexusId,
        source: Option<ReplicaId>,
        target: ReplicaId,
    ) -> Self {
        Self {
            volume,
            nexus,
            source,
            target,
            started: Instant::now(),
            progress: 0,
            permit,
        }
    }

    /// Scope the job occupies a slot in.
    pub fn scope(&self) -> &RebuildScope {
        self.permit.scope()
    }
}

/// Read-only snapshot of a [`RebuildJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildJobInfo {
    pub volume: VolumeId,
    pub target: ReplicaId,
    pub scope: RebuildScope,
    pub progress: u8,
}

/// Admission controller and registry of active rebuild jobs.
#[derive(Debug)]
pub struct RebuildAdmission {
    limit: Option<u32>,
    domain: RebuildDomain,
    active: Arc<DashMap<RebuildScope, u32>>,
    /// Active jobs keyed by the replica being rebuilt.
    jobs: DashMap<ReplicaId, RebuildJob>,
    /// Slots held by faulted replicas still attached to a nexus.
    held: DashMap<ReplicaId, RebuildPermit>,
}

impl RebuildAdmission {
    /// `limit` of `None` means rebuilds are not capped.
    pub fn new(limit: Option<u32>, domain: RebuildDomain) -> Self {
        Self {
            limit,
            domain,
            active: Arc::new(DashMap::new()),
            jobs: DashMap::new(),
            held: DashMap::new(),
        }
    }

    /// Configured cap, if any.
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// `true` when the cap is zero and no rebuild can ever be admitted.
    pub fn disabled(&self) -> bool {
        self.limit == Some(0)
    }

    /// Scope a rebuild of a replica hosted on `node` is counted against.
    pub fn scope_for(&self, node: &NodeId) -> RebuildScope {
        match self.domain {
            RebuildDomain::Global => RebuildScope::Global,
            RebuildDomain::PerNode => RebuildScope::Node(node.clone()),
        }
    }

    /// Claim a rebuild slot in `scope`, or fail with
    /// [`VolumeError::RebuildsExhausted`] if the scope is full.
    pub fn try_admit(&self, scope: RebuildScope) -> Result<RebuildPermit, VolumeError> {
        if let Some(limit) = self.limit {
            // The entry guard holds the shard write lock, so the check and the
            // increment below cannot interleave with another caller.
            let mut count = self.active.entry(scope.clone()).or_insert(0);
            if *count >= limit {
                warn!(%scope, limit, "rebuild admission rejected");
                return Err(VolumeError::RebuildsExhausted { scope, limit });
            }
            *count += 1;
        } else {
            *self.active.entry(scope.clone()).or_insert(0) += 1;
        }
        debug!(%scope, "rebuild slot admitted");
        Ok(RebuildPermit {
            scope,
            active: Arc::clone(&self.active),
        })
    }

    /// Claim one slot per node in `nodes`, all or nothing.
    pub fn try_admit_all<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId>,
    ) -> Result<Vec<RebuildPermit>, VolumeError> {
        // Permits already taken are dropped, and so released, on early return.
        nodes
            .into_iter()
            .map(|node| self.try_admit(self.scope_for(node)))
            .collect()
    }

    /// Occupy a slot in `scope` regardless of the cap.
    fn occupy(&self, scope: RebuildScope) -> RebuildPermit {
        let mut count = self.active.entry(scope.clone()).or_insert(0);
        if self.limit.is_some_and(|limit| *count >= limit) {
            warn!(%scope, active = *count, "rebuild slot owed, scope over its limit");
        }
        *count += 1;
        drop(count);
        RebuildPermit {
            scope,
            active: Arc::clone(&self.active),
        }
    }

    /// Keep a slot for a faulted replica attached to a nexus.  A replica whose
    /// rebuild job is still registered already holds one.
    pub fn hold_faulted(&self, replica: ReplicaId, scope: RebuildScope) {
        if self.jobs.contains_key(&replica) || self.held.contains_key(&replica) {
            return;
        }
        let permit = self.occupy(scope);
        debug!(replica.uuid = %replica, scope = %permit.scope(), "faulted replica holds a rebuild slot");
        self.held.insert(replica, permit);
    }

    /// Whether `replica` holds a slot as a faulted child.
    pub fn is_held(&self, replica: &ReplicaId) -> bool {
        self.held.contains_key(replica)
    }

    /// Free every slot `replica` occupies, as a job or as a faulted child.
    /// Called once the replica is gone.
    pub fn release(&self, replica: &ReplicaId) {
        self.deregister(replica);
        if self.held.remove(replica).is_some() {
            debug!(replica.uuid = %replica, "faulted replica released its rebuild slot");
        }
    }

    /// Number of slots currently held in `scope`.
    pub fn active(&self, scope: &RebuildScope) -> u32 {
        self.active.get(scope).map(|c| *c).unwrap_or(0)
    }

    /// Record an admitted job as active.
    pub fn register(&self, job: RebuildJob) {
        info!(
            volume.uuid = %job.volume,
            replica.uuid = %job.target,
            scope = %job.scope(),
            "rebuild started"
        );
        if let Some(previous) = self.jobs.insert(job.target, job) {
            warn!(replica.uuid = %previous.target, "replaced an existing rebuild job");
        }
    }

    /// Remove the job rebuilding `target`, freeing its slot.
    pub fn deregister(&self, target: &ReplicaId) -> Option<RebuildJobInfo> {
        let (_, job) = self.jobs.remove(target)?;
        let info = Self::info(&job);
        info!(
            volume.uuid = %job.volume,
            replica.uuid = %job.target,
            elapsed = ?job.started.elapsed(),
            "rebuild job finished"
        );
        Some(info)
    }

    /// Record progress reported by the engine.
    pub fn update_progress(&self, target: &ReplicaId, progress: u8) {
        if let Some(mut job) = self.jobs.get_mut(target) {
            job.progress = progress;
        }
    }

    /// Snapshot of the job rebuilding `target`.
    pub fn job(&self, target: &ReplicaId) -> Option<RebuildJobInfo> {
        self.jobs.get(target).map(|job| Self::info(&job))
    }

    /// Snapshot of every active job belonging to `volume`.
    pub fn jobs_for(&self, volume: &VolumeId) -> Vec<RebuildJobInfo> {
        self.jobs
            .iter()
            .filter(|job| &job.volume == volume)
            .map(|job| Self::info(&job))
            .collect()
    }

    /// Number of registered jobs across all scopes.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn info(job: &RebuildJob) -> RebuildJobInfo {
        RebuildJobInfo {
            volume: job.volume,
            target: job.target,
            scope: job.scope().clone(),
            progress: job.progress,
        }
    }
}
