//! Explicit per-volume node state.
//!
//! ```text
//! Unstaged --stage--> Staged --publish--> Published
//!    ^                  |  ^                  |
//!    +-----unstage------+  +----unpublish-----+
//! ```
//!
//! Every committed transition goes through [`VolumeStates::transition`],
//! which refuses edges not in the diagram.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CsiError;
use crate::types::VolumeId;

/// Lifecycle state of a volume on this node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeVolumeState {
    #[default]
    Unstaged,
    Staged,
    Published,
}

impl NodeVolumeState {
    /// Whether `self -> next` is a legal transition.  Staying put is legal.
    pub fn can_become(self, next: Self) -> bool {
        use NodeVolumeState::*;
        matches!(
            (self, next),
            (Unstaged, Staged) | (Staged, Published) | (Published, Staged) | (Staged, Unstaged)
        ) || self == next
    }
}

impl fmt::Display for NodeVolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The state of every volume this node knows about.  Absent means Unstaged.
#[derive(Debug, Default)]
pub struct VolumeStates {
    states: DashMap<VolumeId, NodeVolumeState>,
}

impl VolumeStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, volume: &VolumeId) -> NodeVolumeState {
        self.states.get(volume).map(|s| *s).unwrap_or_default()
    }

    /// Move `volume` to `next`, or fail with [`CsiError::Internal`] if the
    /// edge is not allowed.
    pub fn transition(&self, volume: &VolumeId, next: NodeVolumeState) -> Result<(), CsiError> {
        let current = self.get(volume);
        if !current.can_become(next) {
            return Err(CsiError::Internal(format!(
                "volume {volume} cannot go from {current} to {next}"
            )));
        }
        match next {
            NodeVolumeState::Unstaged => {
                self.states.remove(volume);
            }
            other => {
                self.states.insert(volume.clone(), other);
            }
        }
        debug!(%volume, from = %current, to = %next, "node volume state");
        Ok(())
    }

    /// Volumes not in the Unstaged state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_edges() {
        use NodeVolumeState::*;
        assert!(Unstaged.can_become(Staged));
        assert!(Staged.can_become(Published));
        assert!(Published.can_become(Staged));
        assert!(Staged.can_become(Unstaged));
        assert!(!Published.can_become(Unstaged));
        assert!(!Unstaged.can_become(Published));
    }

    #[test]
    fn transitions_are_tracked() {
        let states = VolumeStates::new();
        let v: VolumeId = "v1".into();
        assert_eq!(states.get(&v), NodeVolumeState::Unstaged);
        states.transition(&v, NodeVolumeState::Staged).unwrap();
        states.transition(&v, NodeVolumeState::Published).unwrap();
        assert!(states.transition(&v, NodeVolumeState::Unstaged).is_err());
        states.transition(&v, NodeVolumeState::Staged).unwrap();
        states.transition(&v, NodeVolumeState::Unstaged).unwrap();
        assert!(states.is_empty());
    }
}
