//! Volume lifecycle orchestration: create, attach, detach, snapshot, delete,
//! and image registration.
//!
//! Every provider call is followed by a bounded wait for the state the next
//! step depends on, and every volume's progress is checked against
//! [`PhaseTracker`] so steps cannot be skipped or repeated.

use std::fmt;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::backend::{InstanceHandle, InstanceNetworking};
use crate::config::LifecyclePolicy;
use crate::device::resolve_attached_device;
use crate::image::{ImageBackend, ImageHandle, ImageRequest, InstanceImageRequest};
use crate::remote::{CommandRunner, RemoteExecutor};
use crate::snapshot::{SnapshotHandle, SnapshotStatus};
use crate::volume::{VolumeHandle, VolumeRequest, VolumeState};
use crate::wait::{PollPolicy, Verdict, classify_membership, poll_until};

mod error;
mod state;

pub use error::LifecycleError;
pub use state::{PhaseTracker, TransitionError, VolumePhase};

/// Result of a successful attachment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachedDevice {
    /// Volume as observed once attached.
    pub volume: VolumeHandle,
    /// Device the volume appeared as on the instance.
    pub device: String,
    /// Device that was requested.
    pub requested: String,
}

/// Volume view whose `Display` is just the state, for wait logs.
struct ObservedVolume(VolumeHandle);

impl fmt::Display for ObservedVolume {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.state, formatter)
    }
}

/// Snapshot view whose `Display` is just the status, for wait logs.
struct ObservedSnapshot(SnapshotHandle);

impl fmt::Display for ObservedSnapshot {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.status, formatter)
    }
}

/// A volume the provider accepted but that may not be available yet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingVolume {
    /// Volume as returned by the create call.
    pub volume: VolumeHandle,
    /// Size of the source snapshot the volume must reach, if restoring.
    pub minimum_gb: Option<u64>,
}

/// Drives volumes through their lifecycle against a backend.
#[derive(Debug)]
pub struct VolumeLifecycle<B, R: CommandRunner> {
    backend: B,
    remote: RemoteExecutor<R>,
    policy: LifecyclePolicy,
    tracker: PhaseTracker,
}

impl<B, R> VolumeLifecycle<B, R>
where
    B: ImageBackend,
    R: CommandRunner,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub fn new(backend: B, remote: RemoteExecutor<R>, policy: LifecyclePolicy) -> Self {
        Self {
            backend,
            remote,
            policy,
            tracker: PhaseTracker::default(),
        }
    }

    /// Backend used for provider calls.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Executor used for commands on the instance.
    #[must_use]
    pub const fn remote(&self) -> &RemoteExecutor<R> {
        &self.remote
    }

    /// Polling budgets in effect.
    #[must_use]
    pub const fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Current phase of a volume touched by this run.
    #[must_use]
    pub fn phase(&self, volume_id: &str) -> Option<VolumePhase> {
        self.tracker.phase(volume_id)
    }

    /// Marks a volume failed, ahead of best-effort cleanup.
    pub fn mark_failed(&mut self, volume_id: &str) {
        self.tracker.fail(volume_id);
    }

    /// Creates a volume and waits for it to become available.
    ///
    /// When restoring from a snapshot, the snapshot must be complete and the
    /// volume is grown to at least the snapshot's size. Callers that must
    /// clean up after a failed wait use [`Self::request_volume`] and
    /// [`Self::await_volume`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] when neither a size nor a
    /// snapshot is given, or the provider returns an undersized volume;
    /// [`LifecycleError::Provisioning`] when the provider refuses; and the
    /// polling kinds when the volume never becomes available.
    pub async fn create_volume(
        &mut self,
        request: &VolumeRequest,
    ) -> Result<VolumeHandle, LifecycleError<B::Error>> {
        let pending = self.request_volume(request).await?;
        self.await_volume(&pending).await
    }

    /// Asks the provider for a volume without waiting for it.
    ///
    /// The returned volume exists at the provider from this point on, so it
    /// must be deleted if a later step fails.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] when neither a size nor a
    /// snapshot is given or the snapshot is incomplete, and
    /// [`LifecycleError::Provisioning`] when the provider refuses.
    pub async fn request_volume(
        &mut self,
        request: &VolumeRequest,
    ) -> Result<PendingVolume, LifecycleError<B::Error>> {
        let minimum_gb = self.minimum_size(request).await?;
        let size_gb = match (request.size_gb, minimum_gb) {
            (Some(0), _) => {
                return Err(LifecycleError::Precondition(format!(
                    "volume {} needs a size greater than zero",
                    request.name
                )));
            }
            (Some(requested), Some(floor)) => requested.max(floor),
            (Some(requested), None) => requested,
            (None, Some(floor)) => floor,
            (None, None) => {
                return Err(LifecycleError::Precondition(format!(
                    "volume {} needs a size or a source snapshot",
                    request.name
                )));
            }
        };
        let effective = request.clone().size_gb(Some(size_gb));

        info!(
            name = %effective.name,
            zone = %effective.zone,
            size_gb,
            snapshot = effective.source_snapshot.as_deref().unwrap_or("none"),
            "creating volume"
        );
        let volume = self
            .backend
            .create_volume(&effective)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "create volume",
                resource: effective.name.clone(),
                source,
            })?;
        self.tracker.begin(&volume.id)?;
        Ok(PendingVolume { volume, minimum_gb })
    }

    /// Waits for a requested volume to become available and checks it is at
    /// least as large as its source snapshot.
    ///
    /// # Errors
    ///
    /// Returns the polling kinds when the volume never becomes available and
    /// [`LifecycleError::Precondition`] when it is undersized. The volume is
    /// marked failed in both cases.
    pub async fn await_volume(
        &mut self,
        pending: &PendingVolume,
    ) -> Result<VolumeHandle, LifecycleError<B::Error>> {
        let created = &pending.volume;
        let policy = self.policy.create;
        let observed = match self
            .wait_for_volume("create volume", created, policy, &[VolumeState::Available])
            .await
        {
            Ok(observed) => observed,
            Err(err) => {
                self.tracker.fail(&created.id);
                return Err(err);
            }
        };

        if let Some(floor) = pending.minimum_gb
            && observed.size_gb < floor
        {
            self.tracker.fail(&observed.id);
            return Err(LifecycleError::Precondition(format!(
                "volume {} is {} GB, smaller than its {floor} GB source snapshot",
                observed.id, observed.size_gb
            )));
        }

        self.tracker.advance(&observed.id, VolumePhase::Available)?;
        info!(volume = %observed.id, size_gb = observed.size_gb, "volume available");
        Ok(observed)
    }

    /// Attaches `volume` to `instance` and identifies the device it appeared
    /// as.
    ///
    /// With device discovery on, the instance's block devices are listed
    /// before and after the attachment and the difference decides the
    /// device. Otherwise the provider's reported device, or the requested one,
    /// is used.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Transition`] unless the volume is available,
    /// [`LifecycleError::Provisioning`] when the provider refuses, the
    /// polling kinds when the attachment never settles, and
    /// [`LifecycleError::Device`] when the device cannot be identified.
    pub async fn attach(
        &mut self,
        volume: &VolumeHandle,
        instance: &InstanceHandle,
        networking: &InstanceNetworking,
        device: &str,
    ) -> Result<AttachedDevice, LifecycleError<B::Error>> {
        self.tracker.adopt(&volume.id, &volume.state);
        self.tracker.check(&volume.id, VolumePhase::Attaching)?;

        let before = if self.policy.device_discovery {
            Some(self.remote.list_block_devices(networking)?)
        } else {
            None
        };

        self.tracker.advance(&volume.id, VolumePhase::Attaching)?;
        info!(volume = %volume.id, instance = %instance.id, device, "attaching volume");
        if let Err(source) = self
            .backend
            .attach_volume(instance, &volume.id, device)
            .await
        {
            self.tracker.fail(&volume.id);
            return Err(LifecycleError::Provisioning {
                operation: "attach volume",
                resource: volume.id.clone(),
                source,
            });
        }

        let policy = self.policy.attach;
        let observed = match self
            .wait_for_volume("attach volume", volume, policy, &VolumeState::ATTACHED)
            .await
        {
            Ok(observed) => observed,
            Err(err) => {
                self.tracker.fail(&volume.id);
                return Err(err);
            }
        };
        self.tracker.advance(&volume.id, VolumePhase::Attached)?;

        let resolved = match before {
            Some(before) => {
                let after = self.remote.list_block_devices(networking)?;
                resolve_attached_device(device, &before, &after)?
            }
            None => observed
                .device
                .clone()
                .unwrap_or_else(|| device.to_owned()),
        };
        if resolved != device {
            info!(requested = device, actual = %resolved, "volume appeared under a different name");
        }
        info!(volume = %observed.id, device = %resolved, "volume attached");

        Ok(AttachedDevice {
            volume: observed,
            device: resolved,
            requested: device.to_owned(),
        })
    }

    /// Force-detaches `volume` from `instance` and waits for it to become
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Transition`] unless the volume is attached,
    /// [`LifecycleError::Provisioning`] when the provider refuses, and the
    /// polling kinds when the detachment never settles.
    pub async fn detach(
        &mut self,
        volume: &VolumeHandle,
        instance: &InstanceHandle,
    ) -> Result<VolumeHandle, LifecycleError<B::Error>> {
        self.tracker.adopt(&volume.id, &volume.state);
        self.tracker.advance(&volume.id, VolumePhase::Detaching)?;
        info!(volume = %volume.id, instance = %instance.id, "detaching volume");

        if let Err(source) = self.backend.detach_volume(instance, &volume.id).await {
            self.tracker.fail(&volume.id);
            return Err(LifecycleError::Provisioning {
                operation: "detach volume",
                resource: volume.id.clone(),
                source,
            });
        }

        let policy = self.policy.detach;
        match self
            .wait_for_volume("detach volume", volume, policy, &[VolumeState::Available])
            .await
        {
            Ok(observed) => {
                self.tracker.advance(&volume.id, VolumePhase::Available)?;
                info!(volume = %volume.id, "volume detached");
                Ok(observed)
            }
            Err(err) => {
                self.tracker.fail(&volume.id);
                Err(err)
            }
        }
    }

    /// Force-detaches a volume during rollback, outside the phase rules.
    ///
    /// The volume is marked failed whatever happens. Returns the volume as
    /// last observed once it is available again, or `None` when the detach
    /// was refused or never settled.
    pub async fn release(
        &mut self,
        volume: &VolumeHandle,
        instance: &InstanceHandle,
    ) -> Option<VolumeHandle> {
        self.tracker.fail(&volume.id);
        if let Err(err) = self.backend.detach_volume(instance, &volume.id).await {
            warn!(volume = %volume.id, error = %err, "rollback detach refused");
            return None;
        }
        let policy = self.policy.detach;
        match self
            .wait_for_volume("detach volume", volume, policy, &[VolumeState::Available])
            .await
        {
            Ok(observed) => Some(observed),
            Err(err) => {
                warn!(volume = %volume.id, error = %err, "rollback detach did not settle");
                None
            }
        }
    }

    /// Snapshots an available volume and waits for the snapshot to complete.
    ///
    /// Progress is logged on every poll; a drop in reported progress is
    /// logged as a warning. Completion requires both a `completed` status and
    /// 100% progress.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] unless the volume is
    /// available, [`LifecycleError::Provisioning`] when the provider refuses,
    /// and the polling kinds when the snapshot never completes.
    pub async fn snapshot(
        &mut self,
        volume: &VolumeHandle,
        description: &str,
    ) -> Result<SnapshotHandle, LifecycleError<B::Error>> {
        let current = self
            .backend
            .describe_volume(&volume.zone, &volume.id)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "describe volume",
                resource: volume.id.clone(),
                source,
            })?;
        self.tracker.adopt(&current.id, &current.state);
        if current.state != VolumeState::Available {
            return Err(LifecycleError::Precondition(format!(
                "volume {} must be available before a snapshot (currently {})",
                current.id, current.state
            )));
        }
        self.tracker.advance(&current.id, VolumePhase::Snapshotting)?;

        let started = Instant::now();
        info!(volume = %current.id, description, "starting snapshot");
        let created = match self
            .backend
            .create_snapshot(&current.zone, &current.id, description)
            .await
        {
            Ok(created) => created,
            Err(source) => {
                self.tracker.fail(&current.id);
                return Err(LifecycleError::Provisioning {
                    operation: "create snapshot",
                    resource: current.id.clone(),
                    source,
                });
            }
        };

        let policy = self.policy.snapshot;
        let backend = &self.backend;
        let (zone, snapshot_id) = (created.zone.as_str(), created.id.as_str());
        let mut last_progress = 0_u8;
        let outcome = poll_until(
            &format!("snapshot {snapshot_id}"),
            policy,
            || async move {
                backend
                    .describe_snapshot(zone, snapshot_id)
                    .await
                    .map(ObservedSnapshot)
            },
            |ObservedSnapshot(snapshot): &ObservedSnapshot| {
                if snapshot.progress < last_progress {
                    warn!(
                        snapshot = %snapshot.id,
                        previous = last_progress,
                        reported = snapshot.progress,
                        "snapshot progress went backwards"
                    );
                }
                last_progress = snapshot.progress;
                info!(
                    snapshot = %snapshot.id,
                    progress = snapshot.progress,
                    status = %snapshot.status,
                    elapsed_secs = started.elapsed().as_secs(),
                    "snapshot progress"
                );
                if snapshot.is_complete() {
                    Verdict::Reached
                } else if snapshot.status == SnapshotStatus::Error {
                    Verdict::Failed
                } else {
                    Verdict::Pending
                }
            },
        )
        .await
        .map(|observed| observed.0);

        match outcome {
            Ok(snapshot) => {
                self.tracker
                    .advance(&current.id, VolumePhase::SnapshotReady)?;
                info!(
                    snapshot = %snapshot.id,
                    volume = %current.id,
                    elapsed_secs = started.elapsed().as_secs(),
                    "snapshot completed"
                );
                Ok(snapshot)
            }
            Err(err) => {
                self.tracker.fail(&current.id);
                Err(LifecycleError::from_poll(
                    "create snapshot",
                    &created.id,
                    err,
                ))
            }
        }
    }

    /// Makes a completed snapshot readable by every account. Returns
    /// `false` without calling the provider when it cannot share snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] unless the snapshot is
    /// complete, and [`LifecycleError::Provisioning`] when the provider
    /// refuses.
    pub async fn publish_snapshot(
        &self,
        snapshot: &SnapshotHandle,
    ) -> Result<bool, LifecycleError<B::Error>> {
        if !self.backend.supports_public_snapshots() {
            info!(snapshot = %snapshot.id, "provider cannot share snapshots; keeping it private");
            return Ok(false);
        }
        if !snapshot.is_complete() {
            return Err(LifecycleError::Precondition(format!(
                "{snapshot} must be completed before it is made public"
            )));
        }
        self.backend
            .publish_snapshot(snapshot)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "publish snapshot",
                resource: snapshot.id.clone(),
                source,
            })?;
        info!(snapshot = %snapshot.id, "snapshot is now public");
        Ok(true)
    }

    /// Records that a volume is kept after its snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Transition`] unless the snapshot completed.
    pub fn retain(&mut self, volume_id: &str) -> Result<(), LifecycleError<B::Error>> {
        self.tracker.advance(volume_id, VolumePhase::Retained)?;
        info!(volume = volume_id, "volume retained");
        Ok(())
    }

    /// Deletes a volume, best effort. Provider errors are logged and
    /// reported as `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Transition`] when the volume is attached or
    /// mid-operation.
    pub async fn delete(
        &mut self,
        volume: &VolumeHandle,
    ) -> Result<bool, LifecycleError<B::Error>> {
        self.tracker.adopt(&volume.id, &volume.state);
        self.tracker.check(&volume.id, VolumePhase::Deleted)?;

        match self.backend.delete_volume(&volume.zone, &volume.id).await {
            Ok(()) => {
                self.tracker.advance(&volume.id, VolumePhase::Deleted)?;
                info!(volume = %volume.id, "volume deleted");
                Ok(true)
            }
            Err(err) => {
                warn!(volume = %volume.id, error = %err, "failed to delete volume");
                Ok(false)
            }
        }
    }

    /// Registers a machine image whose root device is backed by a completed
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Registration`] when the mapping is invalid
    /// or the snapshot is not complete, and
    /// [`LifecycleError::Provisioning`] when the provider refuses.
    pub async fn register_image(
        &self,
        request: &ImageRequest,
    ) -> Result<ImageHandle, LifecycleError<B::Error>> {
        request
            .block_map
            .validate_root(&request.root_device)
            .map_err(|err| LifecycleError::Registration(err.to_string()))?;
        let snapshot_id = request.root_snapshot_id().ok_or_else(|| {
            LifecycleError::Registration(format!(
                "root device {} has no snapshot",
                request.root_device
            ))
        })?;

        let snapshot = self
            .backend
            .describe_snapshot(&request.zone, snapshot_id)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "describe snapshot",
                resource: snapshot_id.to_owned(),
                source,
            })?;
        if !snapshot.is_complete() {
            return Err(LifecycleError::Registration(format!(
                "snapshot {snapshot} must be completed before registering an image"
            )));
        }

        info!(name = %request.name, snapshot = snapshot_id, "registering image");
        let image = self
            .backend
            .register_image(request)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "register image",
                resource: request.name.clone(),
                source,
            })?;
        info!(
            image = %image.id,
            name = %image.name,
            "image registered; it may not be launchable until the provider finishes copying it"
        );
        Ok(image)
    }

    /// Images a running instance with all of its volumes.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provisioning`] when the provider refuses.
    pub async fn image_instance(
        &self,
        request: &InstanceImageRequest,
    ) -> Result<ImageHandle, LifecycleError<B::Error>> {
        info!(name = %request.name, instance = %request.instance.id, "imaging instance");
        let image = self
            .backend
            .image_instance(request)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "image instance",
                resource: request.instance.id.clone(),
                source,
            })?;
        info!(
            image = %image.id,
            name = %image.name,
            "image requested; it may not be launchable until the provider finishes copying it"
        );
        Ok(image)
    }

    /// Makes an image launchable by everyone.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provisioning`] when the provider refuses.
    pub async fn publish_image(
        &self,
        image: &ImageHandle,
    ) -> Result<(), LifecycleError<B::Error>> {
        self.backend
            .publish_image(image)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "publish image",
                resource: image.id.clone(),
                source,
            })?;
        info!(image = %image.id, "image is now public");
        Ok(())
    }

    async fn minimum_size(
        &self,
        request: &VolumeRequest,
    ) -> Result<Option<u64>, LifecycleError<B::Error>> {
        let Some(snapshot_id) = request.source_snapshot.as_deref() else {
            return Ok(None);
        };
        let snapshot = self
            .backend
            .describe_snapshot(&request.zone, snapshot_id)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "describe snapshot",
                resource: snapshot_id.to_owned(),
                source,
            })?;
        if !snapshot.is_complete() {
            return Err(LifecycleError::Precondition(format!(
                "cannot restore from {snapshot}: it has not completed"
            )));
        }
        Ok(Some(snapshot.size_gb))
    }

    async fn wait_for_volume(
        &self,
        operation: &'static str,
        volume: &VolumeHandle,
        policy: PollPolicy,
        targets: &[VolumeState],
    ) -> Result<VolumeHandle, LifecycleError<B::Error>> {
        let backend = &self.backend;
        let label = format!("{operation} {}", volume.id);
        poll_until(
            &label,
            policy,
            || async move {
                backend
                    .describe_volume(&volume.zone, &volume.id)
                    .await
                    .map(ObservedVolume)
            },
            |observed: &ObservedVolume| {
                classify_membership(&observed.0.state, targets, &[VolumeState::Error])
            },
        )
        .await
        .map(|observed| observed.0)
        .map_err(|err| LifecycleError::from_poll(operation, &volume.id, err))
    }
}

#[cfg(test)]
mod tests;
