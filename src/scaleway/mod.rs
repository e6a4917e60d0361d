//! Scaleway backend: instances through `scaleway-rs`, volumes, snapshots, and
//! images through the Instance HTTP API.

mod error;
mod http;
mod image;
mod instance;
mod snapshot;
mod volume;

use std::time::Duration;

use crate::backend::{
    Backend, BackendFuture, InstanceDescription, InstanceHandle, InstanceNetworking,
    InstanceRequest, InstanceState,
};
use crate::config::ScalewayConfig;
use crate::wait::PollPolicy;
use instance::InstanceView;
use scaleway_rs::{ScalewayApi, ScalewayCreateInstanceBuilder, ScalewayError};
use tracing::info;
use uuid::Uuid;

pub use error::ScalewayBackendError;

const DEFAULT_SSH_PORT: u16 = 22;
const INSTANCE_WAIT_ATTEMPTS: u32 = 40;
const INSTANCE_WAIT_DELAY: Duration = Duration::from_secs(6);

/// Backend that drives the Scaleway Instance API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    config: ScalewayConfig,
    ssh_port: u16,
    instance_policy: PollPolicy,
}

impl ScalewayBackend {
    fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        request: &InstanceRequest,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == request.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            ssh_port: DEFAULT_SSH_PORT,
            instance_policy: PollPolicy::new(INSTANCE_WAIT_ATTEMPTS, INSTANCE_WAIT_DELAY),
        })
    }

    /// Configuration the backend was built from.
    #[must_use]
    pub const fn config(&self) -> &ScalewayConfig {
        &self.config
    }

    /// Builds an instance request using the backend's defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when configuration validation
    /// fails.
    pub fn default_request(&self) -> Result<InstanceRequest, ScalewayBackendError> {
        self.config.as_request().map_err(ScalewayBackendError::from)
    }
}

impl Backend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let image_id = self.resolve_image_id(request).await?;

            let name = format!("rebundle-{}", Uuid::new_v4().simple());
            let server = match ScalewayCreateInstanceBuilder::new(
                self.api.clone(),
                &request.zone,
                &name,
                &request.instance_type,
            )
            .image(&image_id)
            .project(&request.project_id)
            .routed_ip_enabled(true)
            .tags(vec![String::from("rebundle")])
            .run_async()
            .await
            {
                Ok(server) => server,
                Err(ScalewayError::Api(api_err))
                    if Self::is_instance_type_error(&api_err, request) =>
                {
                    return Err(ScalewayBackendError::InstanceTypeUnavailable {
                        instance_type: request.instance_type.clone(),
                        zone: request.zone.clone(),
                    });
                }
                Err(other) => return Err(other.into()),
            };

            let view = InstanceView::from(server);
            self.power_on_if_needed(&request.zone, &view).await?;
            info!(instance = %view.id, zone = %request.zone, "instance created");

            Ok(InstanceHandle {
                id: view.id,
                zone: request.zone.clone(),
            })
        })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move { self.wait_for_public_ip(handle).await })
    }

    fn describe_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, Option<InstanceDescription>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .fetch_instance(handle)
                .await?
                .map(|view| InstanceDescription {
                    public_ip: view.address(),
                    state: InstanceState::from_provider(&view.state),
                    handle: InstanceHandle {
                        id: view.id,
                        zone: handle.zone.clone(),
                    },
                }))
        })
    }

    fn reboot<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.reboot_instance(handle).await?;
            info!(instance = %handle.id, "reboot requested");
            Ok(())
        })
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move {
            self.api
                .delete_instance_async(&handle.zone, &handle.id)
                .await?;
            self.wait_until_gone(&handle).await
        })
    }
}

#[cfg(test)]
mod tests;
