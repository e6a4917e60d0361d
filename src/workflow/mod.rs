//! Operator workflows composed from the volume lifecycle.
//!
//! * `setup` provisions (or reuses) an instance, creates and attaches a
//!   volume, prepares and mounts its filesystem, optionally copies a local
//!   directory onto it, and records a handoff file.
//! * `cleanup` reads the handoff file, releases the volume, snapshots it, and
//!   tidies up the instance and volume.
//! * `snapshot` snapshots an existing volume by id.
//! * `register` turns a completed snapshot into a machine image.
//! * `image` images a running instance, rebooting it first when needed.
//!
//! Destructive or publishing steps go through a [`Confirm`] checkpoint.

mod cleanup;
mod image;
mod register;
mod rollback;
mod setup;
mod snapshot;

use camino::Utf8PathBuf;

use crate::backend::InstanceRequest;
use crate::config::LifecycleConfig;
use crate::confirm::Confirm;
use crate::handoff::HandoffStore;
use crate::image::ImageBackend;
use crate::lifecycle::{LifecycleError, VolumeLifecycle};
use crate::remote::CommandRunner;

pub use cleanup::{CleanupOptions, CleanupOutcome};
pub use image::{ImageOptions, InstanceImageOutcome};
pub use register::RegisterOutcome;
pub use setup::SetupOutcome;
pub use snapshot::{ReplacementVolume, SnapshotOptions, SnapshotOutcome};

/// Settings shared by every workflow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowSettings {
    /// Instance created when no existing instance is configured. Its zone,
    /// project, and architecture also scope volumes and images.
    pub instance: InstanceRequest,
    /// Volume, mount, and image settings.
    pub lifecycle: LifecycleConfig,
}

/// Runs workflows against one backend, one remote channel, and one operator.
#[derive(Debug)]
pub struct Workflow<B, R: CommandRunner, C> {
    lifecycle: VolumeLifecycle<B, R>,
    settings: WorkflowSettings,
    confirm: C,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Creates a workflow runner.
    #[must_use]
    pub const fn new(
        lifecycle: VolumeLifecycle<B, R>,
        settings: WorkflowSettings,
        confirm: C,
    ) -> Self {
        Self {
            lifecycle,
            settings,
            confirm,
        }
    }

    /// Lifecycle orchestrator, for inspecting phases after a run.
    #[must_use]
    pub const fn lifecycle(&self) -> &VolumeLifecycle<B, R> {
        &self.lifecycle
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    fn handoff_store(&self) -> HandoffStore {
        HandoffStore::new(Utf8PathBuf::from(&self.settings.lifecycle.handoff_file))
    }

    /// Asks an optional question. `false` means skip the step.
    fn ask(&self, prompt: &str) -> Result<bool, LifecycleError<B::Error>> {
        Ok(self.confirm.confirm(prompt, false)?)
    }

    /// Asks a question whose refusal ends the run.
    fn require(&self, prompt: &str, action: &str) -> Result<(), LifecycleError<B::Error>> {
        if self.confirm.confirm(prompt, true)? {
            Ok(())
        } else {
            Err(LifecycleError::OperatorAborted {
                action: action.to_owned(),
            })
        }
    }
}
