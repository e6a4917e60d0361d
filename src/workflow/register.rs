//! `rebundle register`: machine image from a completed snapshot.

use tracing::info;

use crate::confirm::Confirm;
use crate::image::{BlockDeviceMapping, ImageBackend, ImageHandle, ImageRequest};
use crate::lifecycle::LifecycleError;
use crate::remote::CommandRunner;

use super::Workflow;

/// Result of registering an image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisterOutcome {
    /// Registered image.
    pub image: ImageHandle,
    /// Whether the image was made public.
    pub published: bool,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Registers an image whose root device is restored from `snapshot_id`,
    /// mapping the configured extra devices to ephemeral slots, then offers
    /// to make it public.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Registration`] when the device mapping is
    /// invalid or the snapshot is not complete, and
    /// [`LifecycleError::Provisioning`] when the provider refuses.
    pub async fn register(
        &self,
        snapshot_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<RegisterOutcome, LifecycleError<B::Error>> {
        let lifecycle_config = &self.settings.lifecycle;
        let block_map = BlockDeviceMapping::for_root_snapshot(
            &lifecycle_config.root_device,
            snapshot_id,
            &lifecycle_config.ephemeral_devices,
        )
        .map_err(|err| LifecycleError::Registration(err.to_string()))?;

        let request = ImageRequest {
            name: name.to_owned(),
            description: description.map_or_else(
                || format!("rebundled from snapshot {snapshot_id}"),
                str::to_owned,
            ),
            architecture: self.settings.instance.architecture.clone(),
            kernel_id: lifecycle_config.kernel_id.clone(),
            root_device: lifecycle_config.root_device.clone(),
            block_map,
            zone: self.settings.instance.zone.clone(),
            project_id: self.settings.instance.project_id.clone(),
        };
        let image = self.lifecycle.register_image(&request).await?;

        let published = self.ask(&format!("Make image {} public?", image.id))?;
        if published {
            self.lifecycle.publish_image(&image).await?;
        } else {
            info!(image = %image.id, "image left private");
        }
        Ok(RegisterOutcome { image, published })
    }
}
