//! `rebundle image`: machine image of a running instance.

use tracing::info;

use crate::backend::{InstanceHandle, InstanceNetworking, InstanceState};
use crate::confirm::Confirm;
use crate::image::{ImageBackend, ImageHandle, InstanceImageRequest};
use crate::lifecycle::LifecycleError;
use crate::remote::CommandRunner;

use super::Workflow;

/// Options for `rebundle image`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageOptions {
    /// Instance to image; the configured instance when unset.
    pub instance_id: Option<String>,
    /// Image name.
    pub name: String,
    /// Image description; a default naming the instance is used when unset.
    pub description: Option<String>,
    /// Reboot even when the instance does not ask for it.
    pub force_reboot: bool,
}

/// Result of imaging an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceImageOutcome {
    /// Requested image.
    pub image: ImageHandle,
    /// Whether the instance was rebooted first.
    pub rebooted: bool,
    /// Whether the image was made public.
    pub published: bool,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Images a running instance.
    ///
    /// When the instance reports a pending reboot, or `force_reboot` is set,
    /// the operator must agree to a reboot first and the instance is waited
    /// on until it is reachable again. The image is then requested and
    /// offered for publication.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] when no instance is named or
    /// it is not running, [`LifecycleError::OperatorAborted`] when the
    /// operator declines a needed reboot, [`LifecycleError::Remote`] when
    /// the reboot check fails, and [`LifecycleError::Provisioning`] when the
    /// provider refuses.
    pub async fn image_instance(
        &self,
        options: &ImageOptions,
    ) -> Result<InstanceImageOutcome, LifecycleError<B::Error>> {
        let instance = self.running_instance(options).await?;
        let networking = self.instance_networking(&instance).await?;

        let rebooted = options.force_reboot
            || self.lifecycle.remote().reboot_required(&networking)?;
        if rebooted {
            self.require(
                &format!(
                    "Before imaging, instance {} needs to be rebooted. Reboot it now?",
                    instance.id
                ),
                &format!("rebooting instance {}", instance.id),
            )?;
            self.lifecycle
                .backend()
                .reboot(&instance)
                .await
                .map_err(|source| LifecycleError::Provisioning {
                    operation: "reboot instance",
                    resource: instance.id.clone(),
                    source,
                })?;
            self.instance_networking(&instance).await?;
            info!(instance = %instance.id, "instance back after reboot");
        }

        let request = InstanceImageRequest {
            description: options
                .description
                .clone()
                .unwrap_or_else(|| format!("rebundled from instance {}", instance.id)),
            instance,
            name: options.name.clone(),
            architecture: self.settings.instance.architecture.clone(),
            root_device: self.settings.lifecycle.root_device.clone(),
        };
        let image = self.lifecycle.image_instance(&request).await?;

        let published = self.ask(&format!("Make image {} public?", image.id))?;
        if published {
            self.lifecycle.publish_image(&image).await?;
        } else {
            info!(image = %image.id, "image left private");
        }
        Ok(InstanceImageOutcome {
            image,
            rebooted,
            published,
        })
    }

    async fn running_instance(
        &self,
        options: &ImageOptions,
    ) -> Result<InstanceHandle, LifecycleError<B::Error>> {
        let instance_id = options
            .instance_id
            .clone()
            .or_else(|| self.settings.lifecycle.instance_id.clone())
            .ok_or_else(|| {
                LifecycleError::Precondition(String::from(
                    "no instance to image; pass --instance-id or set instance_id",
                ))
            })?;
        let handle = InstanceHandle {
            id: instance_id,
            zone: self.settings.instance.zone.clone(),
        };
        let description = self
            .lifecycle
            .backend()
            .describe_instance(&handle)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "describe instance",
                resource: handle.id.clone(),
                source,
            })?
            .ok_or_else(|| {
                LifecycleError::Precondition(format!(
                    "instance {} not found in zone {}",
                    handle.id, handle.zone
                ))
            })?;
        if description.state != InstanceState::Running {
            return Err(LifecycleError::Precondition(format!(
                "instance {} is {}, not running",
                handle.id, description.state
            )));
        }
        Ok(handle)
    }

    async fn instance_networking(
        &self,
        instance: &InstanceHandle,
    ) -> Result<InstanceNetworking, LifecycleError<B::Error>> {
        self.lifecycle
            .backend()
            .wait_for_ready(instance)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "wait for instance",
                resource: instance.id.clone(),
                source,
            })
    }
}
