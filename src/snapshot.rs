//! Snapshot types and backend operations.

use std::fmt;

use crate::backend::BackendFuture;
use crate::volume::VolumeBackend;

/// Progress value that marks a finished snapshot.
pub const PROGRESS_COMPLETE: u8 = 100;

/// Status of a snapshot as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotStatus {
    /// The provider is still copying blocks.
    Pending,
    /// The snapshot is usable.
    Completed,
    /// The provider gave up on the snapshot.
    Error,
    /// Any provider token the crate does not model.
    Other(String),
}

impl SnapshotStatus {
    /// Maps a provider status token onto the modelled states.
    #[must_use]
    pub fn from_provider(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "pending" | "snapshotting" | "importing" => Self::Pending,
            "completed" | "available" => Self::Completed,
            "error" | "failed" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => formatter.write_str("pending"),
            Self::Completed => formatter.write_str("completed"),
            Self::Error => formatter.write_str("error"),
            Self::Other(token) => formatter.write_str(token),
        }
    }
}

/// Handle describing a snapshot as last observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotHandle {
    /// Provider-specific snapshot identifier.
    pub id: String,
    /// Zone where the snapshot lives.
    pub zone: String,
    /// Volume the snapshot was taken from.
    pub volume_id: String,
    /// Current status.
    pub status: SnapshotStatus,
    /// Copy progress in percent, clamped to `0..=100`.
    pub progress: u8,
    /// Operator supplied description.
    pub description: String,
    /// Size of the source volume in gigabytes.
    pub size_gb: u64,
}

impl SnapshotHandle {
    /// Returns `true` once the provider reports completion and progress has
    /// reached 100%.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == SnapshotStatus::Completed && self.progress >= PROGRESS_COMPLETE
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "snapshot {} ({}, {}%)",
            self.id, self.status, self.progress
        )
    }
}

/// Backend operations for snapshots.
pub trait SnapshotBackend: VolumeBackend {
    /// Starts a snapshot of the given volume.
    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        volume_id: &'a str,
        description: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, Self::Error>;

    /// Fetches the current view of a snapshot.
    fn describe_snapshot<'a>(
        &'a self,
        zone: &'a str,
        snapshot_id: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, Self::Error>;

    /// Whether snapshots can be shared with every account.
    fn supports_public_snapshots(&self) -> bool;

    /// Makes a completed snapshot readable by every account.
    fn publish_snapshot<'a>(
        &'a self,
        snapshot: &'a SnapshotHandle,
    ) -> BackendFuture<'a, (), Self::Error>;
}
