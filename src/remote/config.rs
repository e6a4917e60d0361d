//! SSH and rsync settings for reaching the instance a volume is attached to.
//!
//! Loaded via `ortho-config`, which merges defaults, `rebundle.toml`, and
//! `REBUNDLE_SSH_*` environment variables.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Remote access settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "REBUNDLE_SSH",
    discovery(
        app_name = "rebundle",
        env_var = "REBUNDLE_CONFIG_PATH",
        config_file_name = "rebundle.toml",
        dotfile_name = ".rebundle.toml",
        project_file_name = "rebundle.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct RemoteConfig {
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as. Also receives ownership of the mount point.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking. Freshly created instances have
    /// unknown host keys, so this defaults to off.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used for authentication. Supports `~/` expansion.
    pub ssh_identity_file: Option<String>,
    /// Whether privileged commands (format, mount, chown) run under `sudo`.
    #[ortho_config(default = true)]
    pub use_sudo: bool,
}

/// Errors raised when loading the remote configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RemoteConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl RemoteConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when any required field is empty.
    pub fn validate(&self) -> Result<(), RemoteError> {
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, RemoteConfigLoadError> {
        Self::load_from_iter([OsString::from("rebundle")])
            .map_err(|err| RemoteConfigLoadError::Parse(err.to_string()))
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), RemoteError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(RemoteError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), RemoteError> {
        Self::require_optional_value(Some(value), field)
    }
}

/// Errors surfaced while running commands on, or copying files to, an
/// instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}: set REBUNDLE_SSH_{env_suffix} or add {field} to [ssh] in rebundle.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the local source directory does not exist.
    #[error("source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be copied.
        path: Utf8PathBuf,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}
