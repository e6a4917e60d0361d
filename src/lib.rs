//! Core library for the `rebundle` volume tool.
//!
//! The crate drives block storage volumes through a checked lifecycle
//! (create → attach → detach → snapshot → delete or retain), registers machine
//! images from completed snapshots or running instances, and exposes a Scaleway implementation of
//! the backend traits. Every wait goes through one bounded poller.

pub mod backend;
pub mod config;
pub mod confirm;
pub mod device;
pub mod handoff;
pub mod image;
pub mod lifecycle;
pub mod remote;
pub mod scaleway;
pub mod snapshot;
pub mod test_support;
pub mod volume;
pub mod wait;
pub mod workflow;

pub use backend::{
    Backend, BackendError, BackendFuture, InstanceDescription, InstanceHandle, InstanceNetworking,
    InstanceRequest, InstanceRequestBuilder, InstanceState,
};
pub use config::{ConfigError, LifecycleConfig, LifecyclePolicy, ScalewayConfig};
pub use confirm::{AssumeYes, Confirm, ConfirmError, TerminalConfirm};
pub use device::DeviceError;
pub use handoff::{HandoffError, HandoffRecord, HandoffStore};
pub use image::{
    BlockDevice, BlockDeviceMapping, ImageBackend, ImageHandle, ImageRequest,
    InstanceImageRequest, MappingError,
};
pub use lifecycle::{
    AttachedDevice, LifecycleError, PendingVolume, VolumeLifecycle, VolumePhase,
};
pub use remote::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommand, RemoteCommandOutput,
    RemoteConfig, RemoteError, RemoteExecutor,
};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};
pub use snapshot::{SnapshotBackend, SnapshotHandle, SnapshotStatus};
pub use volume::{VolumeBackend, VolumeHandle, VolumeRequest, VolumeState};
pub use wait::{PollError, PollPolicy, Verdict, poll_until};
pub use workflow::{
    CleanupOptions, CleanupOutcome, ImageOptions, InstanceImageOutcome, RegisterOutcome,
    ReplacementVolume, SetupOutcome, SnapshotOptions, SnapshotOutcome, Workflow,
    WorkflowSettings,
};
