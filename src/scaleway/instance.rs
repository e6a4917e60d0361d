//! Instance lookup, power, readiness, and teardown helpers.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use scaleway_rs::{ScalewayImage, ScalewayInstance, ScalewayListInstanceImagesBuilder};

use crate::backend::{InstanceHandle, InstanceNetworking, InstanceRequest};
use crate::wait::{PollError, Verdict, poll_until};

use super::{ScalewayBackend, ScalewayBackendError};

/// Point-in-time view of a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct InstanceView {
    pub(super) id: String,
    pub(super) state: String,
    pub(super) allowed_actions: Vec<String>,
    pub(super) public_ip: Option<String>,
}

impl InstanceView {
    pub(super) fn is_running(&self) -> bool {
        self.state == "running"
    }

    pub(super) fn ensure_allowed(&self, action: &'static str) -> Result<(), ScalewayBackendError> {
        if self.allowed_actions.iter().any(|allowed| allowed == action) {
            return Ok(());
        }
        Err(ScalewayBackendError::ActionNotAllowed {
            action,
            instance_id: self.id.clone(),
            state: self.state.clone(),
        })
    }

    pub(super) fn address(&self) -> Option<IpAddr> {
        self.public_ip
            .as_deref()
            .and_then(|ip| IpAddr::from_str(ip).ok())
    }
}

impl From<ScalewayInstance> for InstanceView {
    fn from(server: ScalewayInstance) -> Self {
        Self {
            id: server.id,
            state: server.state,
            allowed_actions: server.allowed_actions,
            public_ip: server.public_ip.map(|ip| ip.address),
        }
    }
}

/// Lookup result whose `Display` feeds the wait logs.
struct Lookup(Option<InstanceView>);

impl fmt::Display for Lookup {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(view) => formatter.write_str(&view.state),
            None => formatter.write_str("absent"),
        }
    }
}

impl ScalewayBackend {
    pub(super) async fn fetch_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<InstanceView>, ScalewayBackendError> {
        let mut servers = self
            .api
            .list_instances(&handle.zone)
            .servers(&handle.id)
            .per_page(1)
            .run_async()
            .await?;
        Ok(servers.pop().map(InstanceView::from))
    }

    pub(super) async fn power_on_if_needed(
        &self,
        zone: &str,
        view: &InstanceView,
    ) -> Result<(), ScalewayBackendError> {
        if view.is_running() {
            return Ok(());
        }
        view.ensure_allowed("poweron")?;
        self.api
            .perform_instance_action_async(zone, &view.id, "poweron")
            .await?;
        Ok(())
    }

    pub(super) async fn reboot_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let view = self
            .fetch_instance(handle)
            .await?
            .ok_or_else(|| ScalewayBackendError::NotFound {
                kind: "instance",
                id: handle.id.clone(),
                zone: handle.zone.clone(),
            })?;
        view.ensure_allowed("reboot")?;
        self.api
            .perform_instance_action_async(&handle.zone, &handle.id, "reboot")
            .await?;
        Ok(())
    }

    /// Waits until the server runs with a public address.
    pub(super) async fn wait_for_public_ip(
        &self,
        handle: &InstanceHandle,
    ) -> Result<InstanceNetworking, ScalewayBackendError> {
        let mut saw_running = false;
        let outcome = poll_until(
            &format!("instance {}", handle.id),
            self.instance_policy,
            || async move { self.fetch_instance(handle).await.map(Lookup) },
            |lookup: &Lookup| match &lookup.0 {
                Some(view) if view.is_running() => {
                    saw_running = true;
                    if view.address().is_some() {
                        Verdict::Reached
                    } else {
                        Verdict::Pending
                    }
                }
                _ => Verdict::Pending,
            },
        )
        .await;

        match outcome {
            Ok(Lookup(Some(view))) => view
                .address()
                .map(|public_ip| InstanceNetworking {
                    public_ip,
                    ssh_port: self.ssh_port,
                })
                .ok_or_else(|| ScalewayBackendError::MissingPublicIp {
                    instance_id: handle.id.clone(),
                }),
            Err(PollError::Fetch { source, .. }) => Err(source),
            Ok(Lookup(None)) | Err(PollError::Exhausted { .. } | PollError::Failed { .. }) => {
                if saw_running {
                    Err(ScalewayBackendError::MissingPublicIp {
                        instance_id: handle.id.clone(),
                    })
                } else {
                    Err(ScalewayBackendError::Timeout {
                        action: String::from("wait_for_ready"),
                        instance_id: handle.id.clone(),
                    })
                }
            }
        }
    }

    /// Waits until the server no longer appears in the API.
    pub(super) async fn wait_until_gone(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let outcome = poll_until(
            &format!("teardown of instance {}", handle.id),
            self.instance_policy,
            || async move { self.fetch_instance(handle).await.map(Lookup) },
            |lookup: &Lookup| {
                if lookup.0.is_none() {
                    Verdict::Reached
                } else {
                    Verdict::Pending
                }
            },
        )
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(PollError::Fetch { source, .. }) => Err(source),
            Err(PollError::Exhausted { .. } | PollError::Failed { .. }) => {
                Err(ScalewayBackendError::ResidualResource {
                    instance_id: handle.id.clone(),
                })
            }
        }
    }

    /// Resolves an image label to the newest available image for the
    /// requested architecture, preferring the project's own images.
    pub(super) async fn resolve_image_id(
        &self,
        request: &InstanceRequest,
    ) -> Result<String, ScalewayBackendError> {
        let project_images = if request.project_id.is_empty() {
            Vec::new()
        } else {
            let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
                .public(true)
                .project(&request.project_id)
                .name(&request.image_label)
                .arch(&request.architecture);
            if let Some(org) = &request.organisation_id {
                scoped = scoped.organization(org);
            }
            scoped.run_async().await?
        };

        let candidates = if project_images.is_empty() {
            ScalewayListInstanceImagesBuilder::new(self.api.clone(), &request.zone)
                .public(true)
                .name(&request.image_label)
                .arch(&request.architecture)
                .run_async()
                .await?
        } else {
            project_images
        };

        select_image_id(candidates, request)
    }
}

/// Picks the newest available image matching the request's architecture.
pub(super) fn select_image_id(
    candidates: Vec<ScalewayImage>,
    request: &InstanceRequest,
) -> Result<String, ScalewayBackendError> {
    candidates
        .into_iter()
        .filter(|image| image.arch == request.architecture && image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
        .ok_or_else(|| ScalewayBackendError::ImageNotFound {
            label: request.image_label.clone(),
            arch: request.architecture.clone(),
            zone: request.zone.clone(),
        })
}
