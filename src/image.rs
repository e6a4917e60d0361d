//! Machine image registration types.
//!
//! An image is registered from a completed root snapshot plus a block device
//! mapping that names every device the booted instance will see. Ephemeral
//! slots are numbered in the order their device names are supplied
//! (`ephemeral0`, `ephemeral1`, ...).
//!
//! A running instance can also be imaged directly; the provider then
//! snapshots every attached volume itself.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::backend::{BackendFuture, InstanceHandle};
use crate::snapshot::SnapshotBackend;

const DEVICE_PREFIX: &str = "/dev/";

/// Source backing a single entry of a block device mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockDevice {
    /// Volume restored from a snapshot at boot.
    Snapshot {
        /// Snapshot identifier.
        snapshot_id: String,
        /// Whether the volume is deleted with the instance.
        delete_on_termination: bool,
    },
    /// Instance-store disk named by the provider (for example `ephemeral0`).
    Ephemeral {
        /// Provider ephemeral name.
        name: String,
    },
}

/// Errors raised while building or validating a block device mapping.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MappingError {
    /// Raised when a device name is not an absolute `/dev/` path.
    #[error("device name '{0}' must be an absolute /dev/ path")]
    InvalidDeviceName(String),
    /// Raised when the same device appears twice.
    #[error("device '{0}' is mapped more than once")]
    DuplicateDevice(String),
    /// Raised when the root device does not map to a snapshot.
    #[error("root device '{0}' must be backed by a snapshot")]
    RootNotSnapshot(String),
}

/// Mapping from device name to its backing source.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockDeviceMapping {
    devices: BTreeMap<String, BlockDevice>,
}

impl BlockDeviceMapping {
    /// Builds the mapping used for rebundled images: the root device restored
    /// from `snapshot_id` and one ephemeral slot per extra device name.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when a device name is malformed or repeated.
    pub fn for_root_snapshot(
        root_device: &str,
        snapshot_id: &str,
        ephemeral_devices: &[String],
    ) -> Result<Self, MappingError> {
        let mut mapping = Self::default();
        mapping.insert(
            root_device,
            BlockDevice::Snapshot {
                snapshot_id: snapshot_id.trim().to_owned(),
                delete_on_termination: true,
            },
        )?;
        for (index, device) in ephemeral_devices.iter().enumerate() {
            mapping.insert(
                device,
                BlockDevice::Ephemeral {
                    name: format!("ephemeral{index}"),
                },
            )?;
        }
        Ok(mapping)
    }

    /// Adds a device to the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::InvalidDeviceName`] for names outside `/dev/`
    /// and [`MappingError::DuplicateDevice`] for repeated names.
    pub fn insert(&mut self, device: &str, source: BlockDevice) -> Result<(), MappingError> {
        let name = device.trim();
        let valid = name
            .strip_prefix(DEVICE_PREFIX)
            .is_some_and(|rest| !rest.is_empty() && !rest.contains(char::is_whitespace));
        if !valid {
            return Err(MappingError::InvalidDeviceName(name.to_owned()));
        }
        if self.devices.contains_key(name) {
            return Err(MappingError::DuplicateDevice(name.to_owned()));
        }
        self.devices.insert(name.to_owned(), source);
        Ok(())
    }

    /// Checks that `root_device` is present and backed by a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::RootNotSnapshot`] otherwise.
    pub fn validate_root(&self, root_device: &str) -> Result<(), MappingError> {
        match self.devices.get(root_device.trim()) {
            Some(BlockDevice::Snapshot { .. }) => Ok(()),
            _ => Err(MappingError::RootNotSnapshot(root_device.trim().to_owned())),
        }
    }

    /// Returns the backing source for a device.
    #[must_use]
    pub fn get(&self, device: &str) -> Option<&BlockDevice> {
        self.devices.get(device)
    }

    /// Iterates over the entries ordered by device name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BlockDevice)> {
        self.devices
            .iter()
            .map(|(name, source)| (name.as_str(), source))
    }

    /// Returns the number of mapped devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` when no devices are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Parameters for registering a machine image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRequest {
    /// Image name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// CPU architecture (for example `x86_64`).
    pub architecture: String,
    /// Kernel identifier, for providers that still take one.
    pub kernel_id: Option<String>,
    /// Name of the root device within `block_map`.
    pub root_device: String,
    /// Devices attached at boot.
    pub block_map: BlockDeviceMapping,
    /// Zone to register the image in.
    pub zone: String,
    /// Project owning the image.
    pub project_id: String,
}

impl ImageRequest {
    /// Returns the snapshot backing the root device, if the mapping has one.
    #[must_use]
    pub fn root_snapshot_id(&self) -> Option<&str> {
        match self.block_map.get(self.root_device.trim()) {
            Some(BlockDevice::Snapshot { snapshot_id, .. }) => Some(snapshot_id.as_str()),
            _ => None,
        }
    }
}

/// Parameters for imaging a running instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceImageRequest {
    /// Instance to image.
    pub instance: InstanceHandle,
    /// Image name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// CPU architecture recorded on the handle.
    pub architecture: String,
    /// Root device name recorded on the handle.
    pub root_device: String,
}

/// Handle returned once an image has been registered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageHandle {
    /// Provider-specific image identifier.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// CPU architecture.
    pub architecture: String,
    /// Root device name.
    pub root_device: String,
    /// Block device mapping the image was registered with.
    pub block_map: BlockDeviceMapping,
    /// Zone the image lives in.
    pub zone: String,
}

/// Backend operations for machine images.
pub trait ImageBackend: SnapshotBackend {
    /// Registers a new image. Registration returns immediately; the image may
    /// not be launchable until the provider finishes copying in the
    /// background.
    fn register_image<'a>(
        &'a self,
        request: &'a ImageRequest,
    ) -> BackendFuture<'a, ImageHandle, Self::Error>;

    /// Images a running instance, volumes included. Like registration, this
    /// returns before the provider has finished copying.
    fn image_instance<'a>(
        &'a self,
        request: &'a InstanceImageRequest,
    ) -> BackendFuture<'a, ImageHandle, Self::Error>;

    /// Grants launch permission on the image to everyone.
    fn publish_image<'a>(&'a self, image: &'a ImageHandle) -> BackendFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn root_snapshot_mapping_numbers_ephemeral_slots() {
        let ephemeral = devices(&["/dev/sdb", "/dev/sdc"]);
        let mapping = BlockDeviceMapping::for_root_snapshot("/dev/sda1", "snap-abc", &ephemeral)
            .unwrap_or_else(|err| panic!("mapping: {err}"));

        assert_eq!(mapping.len(), 3);
        assert_eq!(
            mapping.get("/dev/sdc"),
            Some(&BlockDevice::Ephemeral {
                name: String::from("ephemeral1")
            })
        );
        assert!(mapping.validate_root("/dev/sda1").is_ok());
    }

    #[test]
    fn rejects_relative_device_names() {
        let err = BlockDeviceMapping::for_root_snapshot("sda1", "snap-abc", &[])
            .expect_err("relative root should be rejected");
        assert_eq!(err, MappingError::InvalidDeviceName(String::from("sda1")));
    }

    #[test]
    fn rejects_duplicate_devices() {
        let err = BlockDeviceMapping::for_root_snapshot(
            "/dev/sda1",
            "snap-abc",
            &devices(&["/dev/sdb", "/dev/sdb"]),
        )
        .expect_err("duplicate should be rejected");
        assert_eq!(err, MappingError::DuplicateDevice(String::from("/dev/sdb")));
    }

    #[test]
    fn validate_root_rejects_ephemeral_root() {
        let mut mapping = BlockDeviceMapping::default();
        mapping
            .insert(
                "/dev/sda1",
                BlockDevice::Ephemeral {
                    name: String::from("ephemeral0"),
                },
            )
            .unwrap_or_else(|err| panic!("insert: {err}"));
        assert!(matches!(
            mapping.validate_root("/dev/sda1"),
            Err(MappingError::RootNotSnapshot(_))
        ));
    }
}
