//! Per-volume phase tracking.
//!
//! Each volume a run touches moves through
//! `creating -> available -> attaching -> attached -> detaching -> available
//! -> snapshotting -> snapshot-ready -> deleted | retained`. Anything else is
//! rejected before a provider call is made. Volumes that predate the run are
//! adopted at the phase their observed state implies.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::volume::VolumeState;

/// Phase of a volume within one run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumePhase {
    /// Create issued, waiting for `available`.
    Creating,
    /// Detached and idle.
    Available,
    /// Attach issued, waiting for `attached`/`in-use`.
    Attaching,
    /// Attached to an instance.
    Attached,
    /// Detach issued, waiting for `available`.
    Detaching,
    /// Snapshot issued, waiting for completion.
    Snapshotting,
    /// Snapshot completed.
    SnapshotReady,
    /// Deleted.
    Deleted,
    /// Kept after its snapshot completed.
    Retained,
    /// A transition was exhausted or rejected.
    Failed,
}

impl VolumePhase {
    /// Phase implied by a state observed on a volume the run did not create.
    #[must_use]
    pub const fn from_observed(state: &VolumeState) -> Self {
        match state {
            VolumeState::Creating => Self::Creating,
            VolumeState::Available => Self::Available,
            VolumeState::Attaching => Self::Attaching,
            VolumeState::Attached | VolumeState::InUse => Self::Attached,
            VolumeState::Detaching => Self::Detaching,
            VolumeState::Deleting
            | VolumeState::Error
            | VolumeState::Other(_) => Self::Failed,
        }
    }

    /// Returns `true` when `next` may follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating | Self::Detaching, Self::Available)
                | (Self::Available | Self::Retained, Self::Attaching)
                | (Self::Attaching, Self::Attached)
                | (Self::Attached, Self::Detaching)
                | (Self::Available, Self::Snapshotting)
                | (Self::Snapshotting, Self::SnapshotReady)
                | (Self::SnapshotReady, Self::Retained)
                | (
                    Self::Available | Self::SnapshotReady | Self::Retained | Self::Failed,
                    Self::Deleted
                )
        ) || matches!(next, Self::Failed)
    }
}

impl fmt::Display for VolumePhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Snapshotting => "snapshotting",
            Self::SnapshotReady => "snapshot-ready",
            Self::Deleted => "deleted",
            Self::Retained => "retained",
            Self::Failed => "failed",
        };
        formatter.write_str(label)
    }
}

/// Raised when a volume is asked to move to a phase it cannot reach.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("volume {volume_id} cannot move from {} to {to}", from.map_or_else(|| String::from("none"), |phase| phase.to_string()))]
pub struct TransitionError {
    /// Volume concerned.
    pub volume_id: String,
    /// Current phase, `None` when the volume is unknown to the run.
    pub from: Option<VolumePhase>,
    /// Requested phase.
    pub to: VolumePhase,
}

/// Phases of every volume touched in this run.
#[derive(Clone, Debug, Default)]
pub struct PhaseTracker {
    phases: BTreeMap<String, VolumePhase>,
}

impl PhaseTracker {
    /// Records a freshly created volume.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the volume is already tracked.
    pub fn begin(&mut self, volume_id: &str) -> Result<(), TransitionError> {
        if let Some(existing) = self.phases.get(volume_id) {
            return Err(TransitionError {
                volume_id: volume_id.to_owned(),
                from: Some(*existing),
                to: VolumePhase::Creating,
            });
        }
        self.phases
            .insert(volume_id.to_owned(), VolumePhase::Creating);
        Ok(())
    }

    /// Starts tracking a pre-existing volume at the phase implied by
    /// `observed`. Already tracked volumes keep their phase.
    pub fn adopt(&mut self, volume_id: &str, observed: &VolumeState) -> VolumePhase {
        *self
            .phases
            .entry(volume_id.to_owned())
            .or_insert_with(|| VolumePhase::from_observed(observed))
    }

    /// Checks that `to` is reachable without recording anything.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for unknown volumes and illegal moves.
    pub fn check(&self, volume_id: &str, to: VolumePhase) -> Result<VolumePhase, TransitionError> {
        match self.phases.get(volume_id) {
            Some(from) if from.can_transition_to(to) => Ok(*from),
            from => Err(TransitionError {
                volume_id: volume_id.to_owned(),
                from: from.copied(),
                to,
            }),
        }
    }

    /// Moves a volume to `to`, returning the phase it left.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for unknown volumes and illegal moves.
    pub fn advance(
        &mut self,
        volume_id: &str,
        to: VolumePhase,
    ) -> Result<VolumePhase, TransitionError> {
        let from = self.check(volume_id, to)?;
        self.phases.insert(volume_id.to_owned(), to);
        Ok(from)
    }

    /// Marks a volume failed. Unknown volumes start tracking as failed.
    pub fn fail(&mut self, volume_id: &str) {
        self.phases
            .insert(volume_id.to_owned(), VolumePhase::Failed);
    }

    /// Current phase of a volume.
    #[must_use]
    pub fn phase(&self, volume_id: &str) -> Option<VolumePhase> {
        self.phases.get(volume_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn full_happy_path_is_legal() {
        let mut tracker = PhaseTracker::default();
        tracker
            .begin("vol-1")
            .unwrap_or_else(|err| panic!("begin: {err}"));
        for phase in [
            VolumePhase::Available,
            VolumePhase::Attaching,
            VolumePhase::Attached,
            VolumePhase::Detaching,
            VolumePhase::Available,
            VolumePhase::Snapshotting,
            VolumePhase::SnapshotReady,
            VolumePhase::Deleted,
        ] {
            tracker
                .advance("vol-1", phase)
                .unwrap_or_else(|err| panic!("advance: {err}"));
        }
        assert_eq!(tracker.phase("vol-1"), Some(VolumePhase::Deleted));
    }

    #[rstest]
    #[case(VolumePhase::Attached, VolumePhase::Snapshotting)]
    #[case(VolumePhase::Attached, VolumePhase::Deleted)]
    #[case(VolumePhase::Creating, VolumePhase::Attaching)]
    #[case(VolumePhase::Deleted, VolumePhase::Attaching)]
    #[case(VolumePhase::Snapshotting, VolumePhase::Deleted)]
    fn illegal_transitions_are_rejected(#[case] from: VolumePhase, #[case] to: VolumePhase) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn any_phase_may_fail() {
        assert!(VolumePhase::Attached.can_transition_to(VolumePhase::Failed));
        assert!(VolumePhase::Failed.can_transition_to(VolumePhase::Deleted));
    }

    #[test]
    fn adopt_keeps_known_phase() {
        let mut tracker = PhaseTracker::default();
        assert_eq!(
            tracker.adopt("vol-1", &VolumeState::InUse),
            VolumePhase::Attached
        );
        assert_eq!(
            tracker.adopt("vol-1", &VolumeState::Available),
            VolumePhase::Attached
        );
    }

    #[test]
    fn unknown_volume_cannot_advance() {
        let tracker = PhaseTracker::default();
        let err = tracker
            .check("vol-9", VolumePhase::Attaching)
            .expect_err("unknown volume");
        assert_eq!(err.from, None);
        assert_eq!(
            err.to_string(),
            "volume vol-9 cannot move from none to attaching"
        );
    }
}
