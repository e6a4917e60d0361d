//! Best-effort release of resources created by a failing run.

use tracing::{info, warn};

use crate::backend::InstanceHandle;
use crate::confirm::Confirm;
use crate::image::ImageBackend;
use crate::remote::CommandRunner;
use crate::volume::VolumeHandle;

use super::Workflow;

/// Resources created so far by the current run.
#[derive(Debug, Default)]
pub(super) struct Created {
    pub(super) instance: Option<InstanceHandle>,
    pub(super) volume: Option<VolumeHandle>,
    pub(super) attached_to: Option<InstanceHandle>,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Detaches and deletes the run's volume, then terminates the run's
    /// instance. Returns a note describing what happened, empty when nothing
    /// had been created.
    pub(super) async fn rollback(&mut self, created: Created) -> String {
        let mut notes = Vec::new();

        if let Some(volume) = &created.volume {
            let mut current = volume.clone();
            if let Some(instance) = &created.attached_to {
                match self.lifecycle.release(volume, instance).await {
                    Some(observed) => current = observed,
                    None => notes.push(format!("failed to detach volume {}", volume.id)),
                }
            } else {
                self.lifecycle.mark_failed(&volume.id);
            }
            match self.lifecycle.delete(&current).await {
                Ok(true) => notes.push(format!("deleted volume {}", volume.id)),
                Ok(false) => notes.push(format!("failed to delete volume {}", volume.id)),
                Err(err) => notes.push(format!("kept volume {}: {err}", volume.id)),
            }
        }

        if let Some(instance) = created.instance {
            let instance_id = instance.id.clone();
            match self.lifecycle.backend().destroy(instance).await {
                Ok(()) => notes.push(format!("terminated instance {instance_id}")),
                Err(err) => {
                    warn!(instance = %instance_id, error = %err, "rollback teardown failed");
                    notes.push(format!("failed to terminate instance {instance_id}: {err}"));
                }
            }
        }

        if notes.is_empty() {
            return String::new();
        }
        let note = format!("cleanup: {}", notes.join("; "));
        info!(%note, "rollback finished");
        note
    }
}
