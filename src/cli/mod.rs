//! Command-line interface definitions for the `rebundle` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `rebundle` binary.
#[derive(Debug, Parser)]
#[command(
    name = "rebundle",
    about = "Attach, snapshot, and register block storage volumes as machine images",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Answer yes to every confirmation prompt.
    #[arg(long, short = 'y', global = true, env = "REBUNDLE_ASSUME_YES")]
    pub(crate) yes: bool,
    /// Workflow to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Workflows exposed by the binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create and attach a volume, mount it, and record a handoff file.
    #[command(
        name = "setup",
        about = "Create and attach a volume, mount it, and record a handoff file"
    )]
    Setup,
    /// Detach, snapshot, and tidy up after `setup`.
    #[command(name = "cleanup", about = "Detach, snapshot, and tidy up after setup")]
    Cleanup(CleanupCommand),
    /// Snapshot an existing volume by id.
    #[command(name = "snapshot", about = "Snapshot an existing volume by id")]
    Snapshot(SnapshotCommand),
    /// Register a machine image from a completed snapshot.
    #[command(
        name = "register",
        about = "Register a machine image from a completed snapshot"
    )]
    Register(RegisterCommand),
    /// Image a running instance, rebooting it first when it asks for one.
    #[command(
        name = "image",
        about = "Image a running instance, rebooting it first when it asks for one"
    )]
    Image(ImageCommand),
}

/// Arguments for `rebundle cleanup`.
#[derive(Debug, Args)]
pub(crate) struct CleanupCommand {
    /// Register an image with this name from the snapshot.
    #[arg(long, value_name = "NAME")]
    pub(crate) image_name: Option<String>,
}

/// Arguments for `rebundle snapshot`.
#[derive(Debug, Args)]
pub(crate) struct SnapshotCommand {
    /// Volume to snapshot.
    #[arg(value_name = "VOLUME_ID")]
    pub(crate) volume_id: String,
    /// Snapshot description.
    #[arg(long, value_name = "TEXT")]
    pub(crate) description: Option<String>,
    /// Attach and mount the volume again after the snapshot completes.
    #[arg(long)]
    pub(crate) reattach: bool,
}

/// Arguments for `rebundle register`.
#[derive(Debug, Args)]
pub(crate) struct RegisterCommand {
    /// Completed snapshot backing the root device.
    #[arg(value_name = "SNAPSHOT_ID")]
    pub(crate) snapshot_id: String,
    /// Image name.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: String,
    /// Image description.
    #[arg(long, value_name = "TEXT")]
    pub(crate) description: Option<String>,
}

/// Arguments for `rebundle image`.
#[derive(Debug, Args)]
pub(crate) struct ImageCommand {
    /// Image name.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: String,
    /// Instance to image; defaults to the configured `instance_id`.
    #[arg(long, value_name = "ID")]
    pub(crate) instance_id: Option<String>,
    /// Image description.
    #[arg(long, value_name = "TEXT")]
    pub(crate) description: Option<String>,
    /// Reboot before imaging even when the instance does not ask for it.
    #[arg(long)]
    pub(crate) force_reboot: bool,
}
