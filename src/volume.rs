//! Block storage volume types and the backend operations that drive them.

use std::fmt;

use crate::backend::{Backend, BackendFuture, InstanceHandle};

/// Parameters required to create a block storage volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Human-friendly volume name.
    pub name: String,
    /// Requested size in gigabytes. Optional when restoring from a snapshot.
    pub size_gb: Option<u64>,
    /// Target availability zone.
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// Snapshot to restore the volume from.
    pub source_snapshot: Option<String>,
}

impl VolumeRequest {
    /// Creates a new volume request, trimming string fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        zone: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            size_gb: None,
            zone: zone.into().trim().to_owned(),
            project_id: project_id.into().trim().to_owned(),
            organisation_id: None,
            source_snapshot: None,
        }
    }

    /// Sets the requested size in gigabytes.
    #[must_use]
    pub const fn size_gb(mut self, value: Option<u64>) -> Self {
        self.size_gb = value;
        self
    }

    /// Sets the snapshot the volume is restored from.
    #[must_use]
    pub fn source_snapshot(mut self, value: Option<String>) -> Self {
        self.source_snapshot = value
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty());
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value.map(|id| id.trim().to_owned());
        self
    }
}

/// Attachment state of a volume as reported by the provider.
///
/// Providers disagree on the name of the attached state, so both `attached`
/// and `in-use` are kept distinct and callers wait on either.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// The provider is still allocating the volume.
    Creating,
    /// The volume exists and is not attached to any instance.
    Available,
    /// An attach request is in flight.
    Attaching,
    /// Attached, in providers that report attachment state explicitly.
    Attached,
    /// Attached, in providers that report usage state.
    InUse,
    /// A detach request is in flight.
    Detaching,
    /// A delete request is in flight.
    Deleting,
    /// The provider reports the volume as broken.
    Error,
    /// Any provider token the crate does not model.
    Other(String),
}

impl VolumeState {
    /// States accepted as "attached".
    pub const ATTACHED: [Self; 2] = [Self::Attached, Self::InUse];

    /// Maps a provider state token onto the modelled states.
    #[must_use]
    pub fn from_provider(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "creating" | "fetching" => Self::Creating,
            "available" => Self::Available,
            "attaching" | "hotsyncing" => Self::Attaching,
            "attached" => Self::Attached,
            "in-use" | "in_use" => Self::InUse,
            "detaching" => Self::Detaching,
            "deleting" => Self::Deleting,
            "error" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Returns `true` for the states that mean the volume is attached.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        matches!(self, Self::Attached | Self::InUse)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::InUse => "in-use",
            Self::Detaching => "detaching",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::Other(token) => token.as_str(),
        };
        formatter.write_str(token)
    }
}

/// Handle describing a volume as last observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeHandle {
    /// Provider-specific volume identifier.
    pub id: String,
    /// Zone where the volume lives.
    pub zone: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Attachment state.
    pub state: VolumeState,
    /// Device path the provider reports for the attachment, if any.
    pub device: Option<String>,
    /// Instance the volume is attached to, if any.
    pub instance_id: Option<String>,
}

impl fmt::Display for VolumeHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "volume {} ({})", self.id, self.state)?;
        if let Some(instance) = &self.instance_id {
            write!(formatter, " on {instance}")?;
        }
        Ok(())
    }
}

/// Backend operations required for volume management.
pub trait VolumeBackend: Backend {
    /// Creates a new volume and returns its handle.
    fn create_volume<'a>(
        &'a self,
        request: &'a VolumeRequest,
    ) -> BackendFuture<'a, VolumeHandle, Self::Error>;

    /// Fetches the current view of a volume.
    fn describe_volume<'a>(
        &'a self,
        zone: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, VolumeHandle, Self::Error>;

    /// Requests attachment of a volume to the given instance.
    ///
    /// The device path is a hint; providers may ignore it.
    fn attach_volume<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        volume_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Requests a forced detachment of a volume from the given instance.
    fn detach_volume<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Deletes a volume.
    fn delete_volume<'a>(
        &'a self,
        zone: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;
}
