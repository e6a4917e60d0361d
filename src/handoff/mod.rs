//! Persisted state linking `rebundle setup` to `rebundle cleanup`.
//!
//! Setup records the instance, the volume, and where it is mounted in a flat
//! TOML table of strings. Cleanup reads it back, tears the arrangement down,
//! and removes the file. A fresh write refuses to overwrite an existing file
//! so a second setup cannot lose track of a live volume; cleanup rewrites it
//! in place once it has changed the arrangement.

use std::io;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use thiserror::Error;

use crate::backend::{InstanceHandle, InstanceNetworking};

const VOLUME_KEY: &str = "volume";
const INSTANCE_KEY: &str = "instance";
const ZONE_KEY: &str = "zone";
const PUBLIC_ADDRESS_KEY: &str = "public_address";
const SSH_PORT_KEY: &str = "ssh_port";
const DEVICE_KEY: &str = "device";
const MOUNT_PATH_KEY: &str = "mount_path";
const INSTANCE_CREATED_KEY: &str = "instance_created";
const KEY_FILE_KEY: &str = "key_file";
const SOURCE_SNAPSHOT_KEY: &str = "source_snapshot";

/// Errors raised while reading or writing the handoff file.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file is missing.
    #[error("no handoff file at {path}; run `rebundle setup` first")]
    Missing {
        /// Expected location.
        path: Utf8PathBuf,
    },
    /// Raised when a previous setup was never cleaned up.
    #[error("handoff file {path} already exists; run `rebundle cleanup` or remove it first")]
    AlreadyExists {
        /// Existing file.
        path: Utf8PathBuf,
    },
    /// Raised when the TOML cannot be parsed or rendered.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a required key is absent.
    #[error("{path} is missing required key '{key}'")]
    MissingKey {
        /// File being read.
        path: Utf8PathBuf,
        /// Absent key.
        key: &'static str,
    },
    /// Raised when a key holds a value of the wrong shape.
    #[error("{path} has an invalid '{key}': {message}")]
    InvalidValue {
        /// File being read.
        path: Utf8PathBuf,
        /// Offending key.
        key: &'static str,
        /// Human-readable error message.
        message: String,
    },
}

/// Everything cleanup needs to know about a completed setup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandoffRecord {
    /// Attached volume.
    pub volume_id: String,
    /// Instance the volume is attached to.
    pub instance: InstanceHandle,
    /// How to reach the instance.
    pub networking: InstanceNetworking,
    /// Device the volume appeared as.
    pub device: String,
    /// Where the volume is mounted.
    pub mount_path: String,
    /// Whether setup created the instance (and cleanup may terminate it).
    pub instance_created: bool,
    /// SSH private key used during setup.
    pub key_file: Option<String>,
    /// Snapshot the volume was restored from.
    pub source_snapshot: Option<String>,
}

/// Reads and writes the handoff file at a fixed path.
#[derive(Clone, Debug)]
pub struct HandoffStore {
    path: Utf8PathBuf,
}

impl HandoffStore {
    /// Creates a store for the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the handoff file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns `true` when the file exists.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Io`] when the parent directory cannot be read.
    pub fn exists(&self) -> Result<bool, HandoffError> {
        let (parent, file_name) = self.split()?;
        match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir.try_exists(file_name).map_err(|err| self.io_error(&err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(HandoffError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    /// Writes `record`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::AlreadyExists`] when a file is already present
    /// and [`HandoffError::Io`] when writing fails.
    pub fn write(&self, record: &HandoffRecord) -> Result<(), HandoffError> {
        if self.exists()? {
            return Err(HandoffError::AlreadyExists {
                path: self.path.clone(),
            });
        }

        let (parent, _) = self.split()?;
        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            HandoffError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        self.write_atomic(record)
    }

    /// Overwrites an existing file with `record`.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Missing`] when there is no file to replace and
    /// [`HandoffError::Io`] when writing fails.
    pub fn replace(&self, record: &HandoffRecord) -> Result<(), HandoffError> {
        if !self.exists()? {
            return Err(HandoffError::Missing {
                path: self.path.clone(),
            });
        }
        self.write_atomic(record)
    }

    /// Renders into a sibling temporary file and renames it over the target.
    fn write_atomic(&self, record: &HandoffRecord) -> Result<(), HandoffError> {
        let (parent, file_name) = self.split()?;
        let dir = self.open_parent(parent)?;
        let rendered =
            toml::to_string_pretty(&to_table(record)).map_err(|err| HandoffError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        let staging = format!(".{file_name}.tmp");
        dir.write(&staging, rendered)
            .map_err(|err| self.io_error(&err))?;
        dir.rename(&staging, &dir, file_name).map_err(|err| {
            dir.remove_file(&staging).ok();
            self.io_error(&err)
        })
    }

    /// Reads the record back.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Missing`] when the file is absent, and
    /// [`HandoffError::MissingKey`] or [`HandoffError::InvalidValue`] when
    /// its content is incomplete.
    pub fn load(&self) -> Result<HandoffRecord, HandoffError> {
        if !self.exists()? {
            return Err(HandoffError::Missing {
                path: self.path.clone(),
            });
        }
        let (parent, file_name) = self.split()?;
        let contents = self
            .open_parent(parent)?
            .read_to_string(file_name)
            .map_err(|err| self.io_error(&err))?;
        let table: toml::value::Table =
            toml::from_str(&contents).map_err(|err| HandoffError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        self.parse_table(&table)
    }

    /// Deletes the file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Io`] when removal fails.
    pub fn remove(&self) -> Result<(), HandoffError> {
        if !self.exists()? {
            return Ok(());
        }
        let (parent, file_name) = self.split()?;
        self.open_parent(parent)?
            .remove_file(file_name)
            .map_err(|err| self.io_error(&err))
    }

    fn parse_table(&self, table: &toml::value::Table) -> Result<HandoffRecord, HandoffError> {
        let public_address = self.required(table, PUBLIC_ADDRESS_KEY)?;
        let public_ip = public_address
            .parse::<IpAddr>()
            .map_err(|err| self.invalid(PUBLIC_ADDRESS_KEY, &err))?;
        let ssh_port = self
            .required(table, SSH_PORT_KEY)?
            .parse::<u16>()
            .map_err(|err| self.invalid(SSH_PORT_KEY, &err))?;
        let instance_created = self
            .required(table, INSTANCE_CREATED_KEY)?
            .parse::<bool>()
            .map_err(|err| self.invalid(INSTANCE_CREATED_KEY, &err))?;

        Ok(HandoffRecord {
            volume_id: self.required(table, VOLUME_KEY)?,
            instance: InstanceHandle {
                id: self.required(table, INSTANCE_KEY)?,
                zone: self.required(table, ZONE_KEY)?,
            },
            networking: InstanceNetworking {
                public_ip,
                ssh_port,
            },
            device: self.required(table, DEVICE_KEY)?,
            mount_path: self.required(table, MOUNT_PATH_KEY)?,
            instance_created,
            key_file: self.optional(table, KEY_FILE_KEY)?,
            source_snapshot: self.optional(table, SOURCE_SNAPSHOT_KEY)?,
        })
    }

    fn required(
        &self,
        table: &toml::value::Table,
        key: &'static str,
    ) -> Result<String, HandoffError> {
        self.optional(table, key)?
            .ok_or_else(|| HandoffError::MissingKey {
                path: self.path.clone(),
                key,
            })
    }

    fn optional(
        &self,
        table: &toml::value::Table,
        key: &'static str,
    ) -> Result<Option<String>, HandoffError> {
        let Some(raw) = table.get(key) else {
            return Ok(None);
        };
        let value = raw.as_str().ok_or_else(|| HandoffError::InvalidValue {
            path: self.path.clone(),
            key,
            message: String::from("must be a string"),
        })?;
        let trimmed = value.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
    }

    fn invalid(&self, key: &'static str, err: &impl std::fmt::Display) -> HandoffError {
        HandoffError::InvalidValue {
            path: self.path.clone(),
            key,
            message: err.to_string(),
        }
    }

    fn split(&self) -> Result<(&Utf8Path, &str), HandoffError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = self.path.file_name().ok_or_else(|| HandoffError::Io {
            path: self.path.clone(),
            message: String::from("handoff path is missing a filename"),
        })?;
        Ok((parent, file_name))
    }

    fn open_parent(&self, parent: &Utf8Path) -> Result<Dir, HandoffError> {
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| HandoffError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })
    }

    fn io_error(&self, err: &io::Error) -> HandoffError {
        HandoffError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

fn to_table(record: &HandoffRecord) -> toml::value::Table {
    let mut table = toml::value::Table::new();
    let mut put = |key: &str, value: String| {
        table.insert(key.to_owned(), toml::Value::String(value));
    };
    put(VOLUME_KEY, record.volume_id.clone());
    put(INSTANCE_KEY, record.instance.id.clone());
    put(ZONE_KEY, record.instance.zone.clone());
    put(PUBLIC_ADDRESS_KEY, record.networking.public_ip.to_string());
    put(SSH_PORT_KEY, record.networking.ssh_port.to_string());
    put(DEVICE_KEY, record.device.clone());
    put(MOUNT_PATH_KEY, record.mount_path.clone());
    put(INSTANCE_CREATED_KEY, record.instance_created.to_string());
    if let Some(key_file) = &record.key_file {
        put(KEY_FILE_KEY, key_file.clone());
    }
    if let Some(snapshot) = &record.source_snapshot {
        put(SOURCE_SNAPSHOT_KEY, snapshot.clone());
    }
    table
}

#[cfg(test)]
mod tests;
