//! `rebundle cleanup`: release, snapshot, and tidy up after `setup`.

use tracing::info;

use crate::confirm::Confirm;
use crate::handoff::{HandoffRecord, HandoffStore};
use crate::image::ImageBackend;
use crate::lifecycle::LifecycleError;
use crate::remote::CommandRunner;
use crate::snapshot::SnapshotHandle;

use super::Workflow;
use super::register::RegisterOutcome;

/// Optional cleanup steps.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupOptions {
    /// Register an image with this name from the snapshot.
    pub image_name: Option<String>,
}

/// Result of a successful cleanup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupOutcome {
    /// Completed snapshot of the volume.
    pub snapshot: SnapshotHandle,
    /// Whether the snapshot was made public.
    pub snapshot_published: bool,
    /// Whether the instance was terminated.
    pub instance_terminated: bool,
    /// Whether the volume was deleted.
    pub volume_deleted: bool,
    /// Image registered from the snapshot, if requested.
    pub image: Option<RegisterOutcome>,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Reverses a setup recorded in the handoff file.
    ///
    /// The volume is unmounted (best effort), detached, and snapshotted.
    /// The snapshot is offered for publication when the provider can share
    /// it, and an image is registered from it when requested. Only then is
    /// the instance terminated (when setup created it and the operator
    /// agrees) and the volume deleted (when the operator agrees). The
    /// handoff file is removed at the end.
    ///
    /// Every step before termination leaves the instance and volume intact,
    /// so a failed cleanup can simply be run again. A completed termination
    /// is written back to the handoff file straight away.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Handoff`] when the handoff file is missing
    /// or malformed, [`LifecycleError::OperatorAborted`] when the operator
    /// declines detaching, and the lifecycle kinds for provider and polling
    /// failures.
    pub async fn cleanup(
        &mut self,
        options: &CleanupOptions,
    ) -> Result<CleanupOutcome, LifecycleError<B::Error>> {
        let store = self.handoff_store();
        let record = store.load()?;
        let volume = self
            .lifecycle
            .backend()
            .describe_volume(&record.instance.zone, &record.volume_id)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "describe volume",
                resource: record.volume_id.clone(),
                source,
            })?;

        let detached = if volume.state.is_attached() {
            self.require(
                &format!(
                    "Detach volume {} from instance {} and snapshot it?",
                    volume.id, record.instance.id
                ),
                &format!("detaching volume {}", volume.id),
            )?;
            self.unmount_best_effort(&record.networking, &record.mount_path);
            self.lifecycle.detach(&volume, &record.instance).await?
        } else {
            info!(volume = %volume.id, state = %volume.state, "volume already detached");
            volume
        };

        let description = format!("rebundle snapshot of {}", detached.id);
        let snapshot = self.lifecycle.snapshot(&detached, &description).await?;
        let snapshot_published = self.offer_publish_snapshot(&snapshot).await?;

        let image = match &options.image_name {
            Some(name) => Some(self.register(&snapshot.id, name, None).await?),
            None => None,
        };

        let instance_terminated = self.offer_termination(&store, &record).await?;
        let volume_deleted = self.delete_or_retain(&detached).await?;

        store.remove()?;
        info!(snapshot = %snapshot.id, "cleanup complete");
        Ok(CleanupOutcome {
            snapshot,
            snapshot_published,
            instance_terminated,
            volume_deleted,
            image,
        })
    }

    /// Terminates the instance setup created, when the operator agrees, and
    /// records that it is gone.
    async fn offer_termination(
        &self,
        store: &HandoffStore,
        record: &HandoffRecord,
    ) -> Result<bool, LifecycleError<B::Error>> {
        if !record.instance_created
            || !self.ask(&format!("Terminate instance {}?", record.instance.id))?
        {
            return Ok(false);
        }
        self.lifecycle
            .backend()
            .destroy(record.instance.clone())
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "terminate instance",
                resource: record.instance.id.clone(),
                source,
            })?;
        info!(instance = %record.instance.id, "instance terminated");
        store.replace(&HandoffRecord {
            instance_created: false,
            ..record.clone()
        })?;
        Ok(true)
    }
}
