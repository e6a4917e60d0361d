//! Backend abstraction for the compute instances that host volume work.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Human readable label used for the boot image. The backend resolves this
    /// to a provider specific image identifier.
    pub image_label: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// CPU architecture requested for the instance.
    pub architecture: String,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any string field is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        let required = [
            (self.image_label.as_str(), "image_label"),
            (self.instance_type.as_str(), "instance_type"),
            (self.zone.as_str(), "zone"),
            (self.project_id.as_str(), "project_id"),
            (self.architecture.as_str(), "architecture"),
        ];
        for (value, field) in required {
            if value.is_empty() {
                return Err(BackendError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    image_label: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    architecture: String,
}

impl InstanceRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Builds and validates the [`InstanceRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<InstanceRequest, BackendError> {
        let request = InstanceRequest {
            image_label: self.image_label.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: self.organisation_id.map(|value| value.trim().to_owned()),
            architecture: self.architecture.trim().to_owned(),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Handle identifying an instance, either created by a backend or looked up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Zone in which the instance lives.
    pub zone: String,
}

/// Connection details for reaching an instance once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceNetworking {
    /// Public IPv4 address assigned by the provider.
    pub public_ip: IpAddr,
    /// TCP port for SSH.
    pub ssh_port: u16,
}

/// Power state reported for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// The instance is booting or being allocated.
    Pending,
    /// The instance is up.
    Running,
    /// The instance is powered off but still exists.
    Stopped,
    /// The instance is gone or going away.
    Terminated,
    /// Any provider token the crate does not model.
    Other(String),
}

impl InstanceState {
    /// Maps a provider state token onto the modelled states.
    #[must_use]
    pub fn from_provider(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "pending" | "starting" | "provisioning" => Self::Pending,
            "running" => Self::Running,
            "stopped" | "stopped in place" | "stopping" => Self::Stopped,
            "terminated" | "shutting-down" | "locked" => Self::Terminated,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => formatter.write_str("pending"),
            Self::Running => formatter.write_str("running"),
            Self::Stopped => formatter.write_str("stopped"),
            Self::Terminated => formatter.write_str("terminated"),
            Self::Other(token) => formatter.write_str(token),
        }
    }
}

/// Point-in-time view of an existing instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceDescription {
    /// Handle for subsequent calls.
    pub handle: InstanceHandle,
    /// Current power state.
    pub state: InstanceState,
    /// Public address, when one has been assigned.
    pub public_ip: Option<IpAddr>,
}

/// Errors raised by backends before any provider call is made.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud backends for instances.
pub trait Backend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new instance and returns a handle used for subsequent calls.
    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error>;

    /// Blocks until the instance is ready for SSH and returns networking info.
    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error>;

    /// Looks up an existing instance. Returns `None` when it does not exist.
    fn describe_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, Option<InstanceDescription>, Self::Error>;

    /// Requests a reboot. Returns once the provider accepted the request;
    /// callers wait for readiness with [`Backend::wait_for_ready`].
    fn reboot<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, (), Self::Error>;

    /// Destroys the instance and ensures no provider resources remain.
    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn builder_trims_and_validates() {
        let request = InstanceRequest::builder()
            .image_label(" Ubuntu ")
            .instance_type("DEV1-S")
            .zone("fr-par-1 ")
            .project_id("proj")
            .architecture("x86_64")
            .build()
            .unwrap_or_else(|err| panic!("build request: {err}"));
        assert_eq!(request.image_label, "Ubuntu");
        assert_eq!(request.zone, "fr-par-1");
    }

    #[test]
    fn builder_rejects_missing_zone() {
        let err = InstanceRequest::builder()
            .image_label("Ubuntu")
            .instance_type("DEV1-S")
            .project_id("proj")
            .architecture("x86_64")
            .build()
            .expect_err("zone is required");
        assert_eq!(err, BackendError::Validation(String::from("zone")));
    }

    #[rstest]
    #[case("running", InstanceState::Running)]
    #[case("Starting", InstanceState::Pending)]
    #[case("stopped in place", InstanceState::Stopped)]
    #[case("terminated", InstanceState::Terminated)]
    #[case("rebooting", InstanceState::Other(String::from("rebooting")))]
    fn instance_state_maps_provider_tokens(#[case] token: &str, #[case] expected: InstanceState) {
        assert_eq!(InstanceState::from_provider(token), expected);
    }
}
