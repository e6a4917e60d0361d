//! Resolution of the block device a newly attached volume appeared as.
//!
//! Providers treat the requested device path as a hint; the kernel may name
//! the disk differently. Listing the instance's block devices before and
//! after the attachment and diffing the two sets identifies the real path.

use std::collections::BTreeSet;

use thiserror::Error;

/// Program that lists whole-disk block devices on the instance.
pub const LIST_BLOCK_DEVICES_PROGRAM: &str = "lsblk";

/// Arguments making [`LIST_BLOCK_DEVICES_PROGRAM`] print one absolute path
/// per line with no header.
pub const LIST_BLOCK_DEVICES_ARGS: [&str; 2] = ["-dpno", "NAME"];

/// Errors raised while resolving the attached device.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeviceError {
    /// No new device appeared after the attachment settled.
    #[error("no new block device appeared after attaching (requested {requested})")]
    NeverAppeared {
        /// Device path that was requested.
        requested: String,
    },
    /// Several devices appeared and none of them was the requested one.
    #[error("ambiguous attachment: requested {requested}, new devices {}", candidates.join(", "))]
    Ambiguous {
        /// Device path that was requested.
        requested: String,
        /// Devices that appeared.
        candidates: Vec<String>,
    },
}

/// Parses the output of the device listing command into a set of paths.
#[must_use]
pub fn parse_device_listing(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("/dev/"))
        .map(ToOwned::to_owned)
        .collect()
}

/// Picks the device a volume attached as, given the listings taken before
/// and after the attachment.
///
/// The requested device wins when it is among the new devices. Otherwise a
/// single new device is accepted as the real name.
///
/// # Errors
///
/// Returns [`DeviceError::NeverAppeared`] when nothing new showed up and
/// [`DeviceError::Ambiguous`] when several unrelated devices did.
pub fn resolve_attached_device(
    requested: &str,
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
) -> Result<String, DeviceError> {
    let new_devices: Vec<&String> = after.difference(before).collect();
    match new_devices.as_slice() {
        [] => Err(DeviceError::NeverAppeared {
            requested: requested.to_owned(),
        }),
        _ if new_devices.iter().any(|device| device.as_str() == requested) => {
            Ok(requested.to_owned())
        }
        [only] => Ok((*only).clone()),
        many => Err(DeviceError::Ambiguous {
            requested: requested.to_owned(),
            candidates: many.iter().map(|device| (*device).clone()).collect(),
        }),
    }
}
