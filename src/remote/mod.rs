//! Command execution on the instance over SSH, plus rsync uploads.
//!
//! Every command goes through a [`CommandRunner`] so tests can script the
//! responses without spawning `ssh`.

use std::collections::BTreeSet;
use std::ffi::OsString;

use camino::Utf8Path;
use tracing::debug;

use crate::backend::InstanceNetworking;
use crate::device::parse_device_listing;

mod command;
mod config;
mod types;
mod util;

pub use camino::Utf8PathBuf;
pub use command::{
    RemoteCommand, change_owner, first_directory_entry, list_block_devices, make_directory,
    make_filesystem, mount, reboot_required, unmount,
};
pub use config::{RemoteConfig, RemoteConfigLoadError, RemoteError};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput};
pub use util::expand_tilde;

/// Runs typed commands on an instance and copies local trees to it.
#[derive(Clone, Debug)]
pub struct RemoteExecutor<R: CommandRunner> {
    config: RemoteConfig,
    runner: R,
}

impl RemoteExecutor<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: RemoteConfig) -> Result<Self, RemoteError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteExecutor<R> {
    /// Creates a new executor using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: RemoteConfig, runner: R) -> Result<Self, RemoteError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Runs `command` over SSH and returns its output whatever the exit code.
    ///
    /// # Errors
    ///
    /// Propagates failures to spawn the SSH client.
    pub fn run(
        &self,
        networking: &InstanceNetworking,
        command: &RemoteCommand,
    ) -> Result<RemoteCommandOutput, RemoteError> {
        let rendered = command.render(self.config.use_sudo);
        debug!(host = %networking.public_ip, command = %rendered, "running remote command");
        let args = self.build_ssh_args(networking, &rendered);
        let output = self.runner.run(&self.config.ssh_bin, &args)?;

        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Runs `command` over SSH and requires a zero exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] when the remote command exits
    /// non-zero or without a status.
    pub fn run_checked(
        &self,
        networking: &InstanceNetworking,
        command: &RemoteCommand,
    ) -> Result<RemoteCommandOutput, RemoteError> {
        let output = self.run(networking, command)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(command_failure(
            command.program(),
            output.exit_code,
            output.stderr,
        ))
    }

    /// Lists the whole-disk block devices visible on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the listing command fails.
    pub fn list_block_devices(
        &self,
        networking: &InstanceNetworking,
    ) -> Result<BTreeSet<String>, RemoteError> {
        let output = self.run_checked(networking, &list_block_devices())?;
        Ok(parse_device_listing(&output.stdout))
    }

    /// Reports whether the instance is waiting for a reboot to finish
    /// applying updates.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] when the check itself fails
    /// (any exit code other than 0 or 1).
    pub fn reboot_required(&self, networking: &InstanceNetworking) -> Result<bool, RemoteError> {
        let command = reboot_required();
        let output = self.run(networking, &command)?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            status => Err(command_failure(command.program(), status, output.stderr)),
        }
    }

    /// Copies the contents of `source` into `remote_path` on the instance.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::MissingSource`] when the source directory is
    /// absent, or [`RemoteError::CommandFailure`] if `rsync` exits non-zero.
    pub fn upload(
        &self,
        source: &Utf8Path,
        networking: &InstanceNetworking,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        let args = self.build_rsync_args(source, networking, remote_path)?;
        let output = self.runner.run(&self.config.rsync_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(command_failure(
            &self.config.rsync_bin,
            output.code,
            output.stderr,
        ))
    }

    fn build_rsync_args(
        &self,
        source: &Utf8Path,
        networking: &InstanceNetworking,
        remote_path: &str,
    ) -> Result<Vec<OsString>, RemoteError> {
        if !source.is_dir() {
            return Err(RemoteError::MissingSource {
                path: source.to_path_buf(),
            });
        }

        Ok(vec![
            OsString::from("-az"),
            OsString::from("--rsh"),
            OsString::from(self.build_remote_shell(networking.ssh_port)),
            OsString::from(format!("{source}/")),
            OsString::from(format!(
                "{}@{}:{remote_path}",
                self.config.ssh_user, networking.public_ip
            )),
        ])
    }

    fn build_ssh_args(
        &self,
        networking: &InstanceNetworking,
        remote_command: &str,
    ) -> Vec<OsString> {
        let mut args = self.common_ssh_options(networking.ssh_port);
        args.push(OsString::from(format!(
            "{}@{}",
            self.config.ssh_user, networking.public_ip
        )));
        args.push(OsString::from(remote_command));
        args
    }

    fn common_ssh_options(&self, port: u16) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(port.to_string())];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args
    }

    fn build_remote_shell(&self, port: u16) -> String {
        let opts = self
            .common_ssh_options(port)
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {}", self.config.ssh_bin, opts)
    }
}

fn command_failure(program: &str, status: Option<i32>, stderr: String) -> RemoteError {
    let status_text = status.map_or_else(|| String::from("unknown"), |code| code.to_string());
    RemoteError::CommandFailure {
        program: program.to_owned(),
        status,
        status_text,
        stderr,
    }
}

#[cfg(test)]
mod tests;
