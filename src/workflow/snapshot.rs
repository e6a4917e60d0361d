//! `rebundle snapshot`: snapshot an existing volume by id.
//!
//! After the snapshot the old volume is either reattached or offered for
//! deletion. A volume that was detached for the snapshot and not reattached
//! can be replaced by a fresh volume restored from the new snapshot.

use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{InstanceHandle, InstanceNetworking};
use crate::confirm::Confirm;
use crate::image::ImageBackend;
use crate::lifecycle::LifecycleError;
use crate::remote::{CommandRunner, change_owner, mount, unmount};
use crate::snapshot::SnapshotHandle;
use crate::volume::{VolumeHandle, VolumeRequest};

use super::Workflow;
use super::rollback::Created;

/// Options for `rebundle snapshot`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SnapshotOptions {
    /// Snapshot description; a default naming the volume is used when unset.
    pub description: Option<String>,
    /// Attach and mount the volume again once the snapshot completes.
    pub reattach: bool,
}

/// Result of a standalone snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotOutcome {
    /// Completed snapshot.
    pub snapshot: SnapshotHandle,
    /// Whether the snapshot was made public.
    pub published: bool,
    /// Whether the volume was deleted afterwards.
    pub volume_deleted: bool,
    /// Device the volume was reattached as.
    pub reattached_device: Option<String>,
    /// Volume restored from the snapshot in place of the old one.
    pub replacement: Option<ReplacementVolume>,
}

/// Fresh volume restored from a snapshot and mounted where the old one was.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplacementVolume {
    /// Restored volume, as observed once attached.
    pub volume: VolumeHandle,
    /// Device it appeared as.
    pub device: String,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Snapshots `volume_id`. An attached volume is unmounted (best effort)
    /// and detached first, after the operator agrees.
    ///
    /// Once complete, the snapshot is offered for publication when the
    /// provider can share snapshots. Then the volume is either reattached,
    /// or offered for deletion and, when it had been attached, replaced by a
    /// new volume restored from the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::OperatorAborted`] when the operator declines
    /// detaching, [`LifecycleError::Precondition`] when an attached volume
    /// does not name its instance, and the lifecycle kinds for provider and
    /// polling failures.
    pub async fn snapshot_volume(
        &mut self,
        volume_id: &str,
        options: &SnapshotOptions,
    ) -> Result<SnapshotOutcome, LifecycleError<B::Error>> {
        let zone = self.settings.instance.zone.clone();
        let volume = self
            .lifecycle
            .backend()
            .describe_volume(&zone, volume_id)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "describe volume",
                resource: volume_id.to_owned(),
                source,
            })?;
        if options.reattach && !volume.state.is_attached() {
            return Err(LifecycleError::Precondition(format!(
                "volume {volume_id} is not attached; nothing to reattach"
            )));
        }

        let mut previous = None;
        let volume = if volume.state.is_attached() {
            let instance = InstanceHandle {
                id: volume.instance_id.clone().ok_or_else(|| {
                    LifecycleError::Precondition(format!(
                        "volume {volume_id} is attached but reports no instance"
                    ))
                })?,
                zone: volume.zone.clone(),
            };
            self.require(
                &format!("Detach volume {volume_id} from instance {}?", instance.id),
                &format!("detaching volume {volume_id}"),
            )?;
            self.unmount_before_detach(&instance).await?;
            let detached = self.lifecycle.detach(&volume, &instance).await?;
            previous = Some(instance);
            detached
        } else {
            volume
        };

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| format!("rebundle snapshot of {volume_id}"));
        let snapshot = self.lifecycle.snapshot(&volume, &description).await?;
        let published = self.offer_publish_snapshot(&snapshot).await?;

        if options.reattach {
            let Some(instance) = previous else {
                return Err(LifecycleError::Precondition(format!(
                    "volume {volume_id} lost its instance before reattaching"
                )));
            };
            let device = self.reattach(&volume, &instance).await?;
            return Ok(SnapshotOutcome {
                snapshot,
                published,
                volume_deleted: false,
                reattached_device: Some(device),
                replacement: None,
            });
        }

        let volume_deleted = self.delete_or_retain(&volume).await?;
        let mut replacement = None;
        if let Some(instance) = previous
            && self.ask(&format!(
                "Create a new volume from snapshot {} and attach it to instance {}?",
                snapshot.id, instance.id
            ))?
        {
            replacement = Some(self.restore_onto(&snapshot, volume.size_gb, &instance).await?);
        }
        Ok(SnapshotOutcome {
            snapshot,
            published,
            volume_deleted,
            reattached_device: None,
            replacement,
        })
    }

    /// Offers to make `snapshot` public when the provider can share it.
    pub(super) async fn offer_publish_snapshot(
        &self,
        snapshot: &SnapshotHandle,
    ) -> Result<bool, LifecycleError<B::Error>> {
        if !self.lifecycle.backend().supports_public_snapshots() {
            return Ok(false);
        }
        if self.ask(&format!("Make snapshot {} public?", snapshot.id))? {
            return self.lifecycle.publish_snapshot(snapshot).await;
        }
        info!(snapshot = %snapshot.id, "snapshot left private");
        Ok(false)
    }

    /// Deletes `volume` when the operator agrees, otherwise keeps it.
    pub(super) async fn delete_or_retain(
        &mut self,
        volume: &VolumeHandle,
    ) -> Result<bool, LifecycleError<B::Error>> {
        if self.ask(&format!("Delete volume {}?", volume.id))? {
            if self.lifecycle.delete(volume).await? {
                return Ok(true);
            }
            warn!(volume = %volume.id, "volume kept after failed delete");
            return Ok(false);
        }
        self.lifecycle.retain(&volume.id)?;
        Ok(false)
    }

    async fn unmount_before_detach(
        &self,
        instance: &InstanceHandle,
    ) -> Result<(), LifecycleError<B::Error>> {
        let networking = self
            .lifecycle
            .backend()
            .wait_for_ready(instance)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "wait for instance",
                resource: instance.id.clone(),
                source,
            })?;
        self.unmount_best_effort(&networking, &self.settings.lifecycle.mount_path);
        Ok(())
    }

    /// Unmounts `mount_path`; failures are logged and the detach goes ahead.
    pub(super) fn unmount_best_effort(&self, networking: &InstanceNetworking, mount_path: &str) {
        match self.lifecycle.remote().run(networking, &unmount(mount_path)) {
            Ok(output) if output.is_success() => {
                info!(mount_path, "volume unmounted");
            }
            Ok(output) => {
                warn!(
                    mount_path,
                    stderr = %output.stderr.trim(),
                    "unmount failed; detaching anyway"
                );
            }
            Err(err) => {
                warn!(mount_path, error = %err, "unmount failed; detaching anyway");
            }
        }
    }

    async fn reattach(
        &mut self,
        volume: &VolumeHandle,
        instance: &InstanceHandle,
    ) -> Result<String, LifecycleError<B::Error>> {
        self.lifecycle.retain(&volume.id)?;
        let networking = self
            .lifecycle
            .backend()
            .wait_for_ready(instance)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "wait for instance",
                resource: instance.id.clone(),
                source,
            })?;
        let device = self.settings.lifecycle.device.clone();
        let attached = self
            .lifecycle
            .attach(volume, instance, &networking, &device)
            .await?;
        self.mount_and_own(&networking, &attached.device)?;
        Ok(attached.device)
    }

    /// Restores a new volume of at least `size_gb` from `snapshot`, attaches
    /// it to `instance`, and mounts it. A failure releases the new volume.
    async fn restore_onto(
        &mut self,
        snapshot: &SnapshotHandle,
        size_gb: u64,
        instance: &InstanceHandle,
    ) -> Result<ReplacementVolume, LifecycleError<B::Error>> {
        let request = VolumeRequest::new(
            format!("rebundle-{}", Uuid::new_v4().simple()),
            &instance.zone,
            &self.settings.instance.project_id,
        )
        .size_gb(Some(size_gb))
        .source_snapshot(Some(snapshot.id.clone()))
        .organisation_id(self.settings.instance.organisation_id.clone());

        let mut created = Created::default();
        match self.restore_steps(&request, instance, &mut created).await {
            Ok(replacement) => Ok(replacement),
            Err(err) => {
                let note = self.rollback(created).await;
                Err(err.with_cleanup_note(note))
            }
        }
    }

    async fn restore_steps(
        &mut self,
        request: &VolumeRequest,
        instance: &InstanceHandle,
        created: &mut Created,
    ) -> Result<ReplacementVolume, LifecycleError<B::Error>> {
        let pending = self.lifecycle.request_volume(request).await?;
        created.volume = Some(pending.volume.clone());
        let volume = self.lifecycle.await_volume(&pending).await?;
        created.volume = Some(volume.clone());

        let networking = self
            .lifecycle
            .backend()
            .wait_for_ready(instance)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "wait for instance",
                resource: instance.id.clone(),
                source,
            })?;
        created.attached_to = Some(instance.clone());
        let device = self.settings.lifecycle.device.clone();
        let attached = self
            .lifecycle
            .attach(&volume, instance, &networking, &device)
            .await?;
        self.mount_and_own(&networking, &attached.device)?;
        info!(volume = %attached.volume.id, device = %attached.device, "replacement volume ready");
        Ok(ReplacementVolume {
            volume: attached.volume,
            device: attached.device,
        })
    }

    fn mount_and_own(
        &self,
        networking: &InstanceNetworking,
        device: &str,
    ) -> Result<(), LifecycleError<B::Error>> {
        let mount_path = &self.settings.lifecycle.mount_path;
        let remote = self.lifecycle.remote();
        remote.run_checked(networking, &mount(device, mount_path))?;
        remote.run_checked(networking, &change_owner(&remote.config().ssh_user, mount_path))?;
        info!(device, mount_path = %mount_path, "volume mounted");
        Ok(())
    }
}
