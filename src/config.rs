//! Configuration loading via `ortho-config`.
//!
//! [`ScalewayConfig`] holds provider credentials and instance defaults under
//! the `SCW_*` prefix. [`LifecycleConfig`] holds the volume, mount, polling,
//! and image settings under `REBUNDLE_*`.

use std::ffi::OsString;
use std::time::Duration;

use crate::backend::InstanceRequest;
use crate::wait::PollPolicy;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not needed for API
    /// calls.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for instances created by `setup`.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the image variant and to tag
    /// registered images.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Block storage class for new volumes (`b_ssd` or `l_ssd`).
    #[ortho_config(default = "b_ssd".to_owned())]
    pub default_volume_type: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in rebundle.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("rebundle")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Builds an [`InstanceRequest`] using the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_request(&self) -> Result<InstanceRequest, ConfigError> {
        self.validate()?;
        InstanceRequest::builder()
            .image_label(&self.default_image)
            .instance_type(&self.default_instance_type)
            .zone(&self.default_zone)
            .project_id(&self.default_project_id)
            .organisation_id(self.default_organization_id.clone())
            .architecture(&self.default_architecture)
            .build()
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.secret_key,
                FieldMetadata::new(
                    "Scaleway API secret key",
                    "SCW_SECRET_KEY",
                    "secret_key",
                    "scaleway",
                ),
            ),
            (
                &self.default_project_id,
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                    "scaleway",
                ),
            ),
            (
                &self.default_image,
                FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
            ),
            (
                &self.default_instance_type,
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                    "scaleway",
                ),
            ),
            (
                &self.default_zone,
                FieldMetadata::new(
                    "availability zone",
                    "SCW_DEFAULT_ZONE",
                    "default_zone",
                    "scaleway",
                ),
            ),
            (
                &self.default_architecture,
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                    "scaleway",
                ),
            ),
            (
                &self.default_volume_type,
                FieldMetadata::new(
                    "volume type",
                    "SCW_DEFAULT_VOLUME_TYPE",
                    "default_volume_type",
                    "scaleway",
                ),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }
        Ok(())
    }
}

/// Volume, mount, polling, and image settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "REBUNDLE",
    discovery(
        app_name = "rebundle",
        env_var = "REBUNDLE_CONFIG_PATH",
        config_file_name = "rebundle.toml",
        dotfile_name = ".rebundle.toml",
        project_file_name = "rebundle.toml"
    )
)]
pub struct LifecycleConfig {
    /// Size of new volumes in gigabytes. Optional when restoring from a
    /// snapshot.
    pub volume_size_gb: Option<u64>,
    /// Snapshot new volumes are restored from.
    pub source_snapshot: Option<String>,
    /// Existing instance to attach to instead of creating one.
    pub instance_id: Option<String>,
    /// Requested device path for the attachment.
    #[ortho_config(default = "/dev/sdf".to_owned())]
    pub device: String,
    /// Whether to diff the instance's block devices to find the real device.
    #[ortho_config(default = true)]
    pub device_discovery: bool,
    /// Mount point on the instance.
    #[ortho_config(default = "/data".to_owned())]
    pub mount_path: String,
    /// Local directory copied onto the volume after mounting.
    pub source_dir: Option<String>,
    /// File linking `setup` to `cleanup`.
    #[ortho_config(default = ".rebundle-handoff.toml".to_owned())]
    pub handoff_file: String,
    /// Attempts while waiting for a new volume to become available.
    #[ortho_config(default = 40)]
    pub create_attempts: u32,
    /// Attempts while waiting for attach or detach to settle.
    #[ortho_config(default = 30)]
    pub attach_attempts: u32,
    /// Seconds between attach, detach, and create polls.
    #[ortho_config(default = 3)]
    pub poll_delay_secs: u64,
    /// Attempts while waiting for a snapshot to complete.
    #[ortho_config(default = 1200)]
    pub snapshot_attempts: u32,
    /// Seconds between snapshot polls.
    #[ortho_config(default = 6)]
    pub snapshot_delay_secs: u64,
    /// Root device name in registered images.
    #[ortho_config(default = "/dev/sda1".to_owned())]
    pub root_device: String,
    /// Extra devices mapped to ephemeral slots in registered images.
    #[ortho_config(default = vec!["/dev/sdb".to_owned(), "/dev/sdc".to_owned()])]
    pub ephemeral_devices: Vec<String>,
    /// Kernel identifier passed at registration, for providers that take one.
    pub kernel_id: Option<String>,
}

impl LifecycleConfig {
    /// Loads configuration without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("rebundle")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks values that have no sensible fallback.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.device,
            &FieldMetadata::new("attach device", "REBUNDLE_DEVICE", "device", "rebundle"),
        )?;
        require_field(
            &self.mount_path,
            &FieldMetadata::new(
                "mount path",
                "REBUNDLE_MOUNT_PATH",
                "mount_path",
                "rebundle",
            ),
        )?;
        require_field(
            &self.handoff_file,
            &FieldMetadata::new(
                "handoff file",
                "REBUNDLE_HANDOFF_FILE",
                "handoff_file",
                "rebundle",
            ),
        )?;
        if !self.mount_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "mount_path must be absolute, got {}",
                self.mount_path
            )));
        }
        if self.volume_size_gb == Some(0) {
            return Err(ConfigError::Invalid(String::from(
                "volume_size_gb must be greater than zero",
            )));
        }
        let budgets = [
            ("create_attempts", self.create_attempts),
            ("attach_attempts", self.attach_attempts),
            ("snapshot_attempts", self.snapshot_attempts),
        ];
        for (name, attempts) in budgets {
            if attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Polling policies derived from the configured budgets.
    #[must_use]
    pub const fn policy(&self) -> LifecyclePolicy {
        let delay = Duration::from_secs(self.poll_delay_secs);
        LifecyclePolicy {
            create: PollPolicy::new(self.create_attempts, delay),
            attach: PollPolicy::new(self.attach_attempts, delay),
            detach: PollPolicy::new(self.attach_attempts, delay),
            snapshot: PollPolicy::new(
                self.snapshot_attempts,
                Duration::from_secs(self.snapshot_delay_secs),
            ),
            device_discovery: self.device_discovery,
        }
    }
}

/// Polling budgets and behaviour switches for the volume lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecyclePolicy {
    /// Wait for a new volume to become available.
    pub create: PollPolicy,
    /// Wait for an attachment to settle.
    pub attach: PollPolicy,
    /// Wait for a detachment to settle.
    pub detach: PollPolicy,
    /// Wait for a snapshot to complete.
    pub snapshot: PollPolicy,
    /// Whether to diff block devices to find the attached device.
    pub device_discovery: bool,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        let delay = Duration::from_secs(3);
        Self {
            create: PollPolicy::new(40, delay),
            attach: PollPolicy::new(30, delay),
            detach: PollPolicy::new(30, delay),
            snapshot: PollPolicy::new(1200, Duration::from_secs(6)),
            device_discovery: true,
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
