//! Image registration and publication through the Instance API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::BackendFuture;
use crate::image::{
    BlockDevice, BlockDeviceMapping, ImageBackend, ImageHandle, ImageRequest,
    InstanceImageRequest,
};

use super::http::ApiCall;
use super::{ScalewayBackend, ScalewayBackendError};

#[derive(Debug, Eq, PartialEq, Serialize)]
pub(super) struct ExtraVolume {
    pub(super) id: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateImageBody<'a> {
    pub(super) name: &'a str,
    pub(super) root_volume: &'a str,
    pub(super) arch: &'a str,
    pub(super) extra_volumes: BTreeMap<String, ExtraVolume>,
    pub(super) project: &'a str,
    pub(super) public: bool,
    pub(super) tags: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct PublishImageBody {
    public: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct BackupBody<'a> {
    pub(super) action: &'static str,
    pub(super) name: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct TaskEnvelope {
    pub(super) task: ServerTask,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerTask {
    pub(super) id: String,
    #[serde(default)]
    pub(super) href_result: Option<String>,
}

/// Image produced by a `backup` task, taken from its result link
/// (`/images/<id>`).
pub(super) fn backup_image_id(
    task: &ServerTask,
    instance_id: &str,
) -> Result<String, ScalewayBackendError> {
    task.href_result
        .as_deref()
        .and_then(|href| href.rsplit_once("/images/"))
        .map(|(_, id)| id.trim_matches('/').to_owned())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            ScalewayBackendError::Validation(format!(
                "backup task {} for instance {instance_id} named no image",
                task.id
            ))
        })
}

#[derive(Debug, Deserialize)]
struct ImageEnvelope {
    image: RegisteredImage,
}

#[derive(Debug, Deserialize)]
struct RegisteredImage {
    id: String,
}

/// Builds the registration payload. Extra snapshot-backed devices become
/// numbered extra volumes; ephemeral slots have no counterpart and are
/// skipped.
pub(super) fn image_body(
    request: &ImageRequest,
) -> Result<CreateImageBody<'_>, ScalewayBackendError> {
    let root_volume = request.root_snapshot_id().ok_or_else(|| {
        ScalewayBackendError::Validation(format!(
            "root device {} has no snapshot",
            request.root_device
        ))
    })?;
    let root_device = request.root_device.trim();

    let mut extra_volumes = BTreeMap::new();
    for (device, source) in request.block_map.iter().filter(|(device, _)| *device != root_device) {
        match source {
            BlockDevice::Snapshot { snapshot_id, .. } => {
                let index = extra_volumes.len() + 1;
                extra_volumes.insert(
                    index.to_string(),
                    ExtraVolume {
                        id: snapshot_id.clone(),
                    },
                );
            }
            BlockDevice::Ephemeral { name } => {
                debug!(device, ephemeral = %name, "skipping ephemeral mapping");
            }
        }
    }
    if let Some(kernel) = &request.kernel_id {
        debug!(kernel = %kernel, "kernel selection is not supported; ignoring");
    }

    Ok(CreateImageBody {
        name: &request.name,
        root_volume,
        arch: &request.architecture,
        extra_volumes,
        project: &request.project_id,
        public: false,
        tags: vec!["rebundle"],
    })
}

impl ImageBackend for ScalewayBackend {
    fn register_image<'a>(
        &'a self,
        request: &'a ImageRequest,
    ) -> BackendFuture<'a, ImageHandle, Self::Error> {
        Box::pin(async move {
            let body = image_body(request)?;
            let url = Self::zone_url(&request.zone, "images");
            let call = ApiCall {
                operation: "register image",
                kind: "image",
                resource: &request.name,
                zone: &request.zone,
            };
            let envelope: ImageEnvelope =
                self.send_json(Self::post(&url).json(&body), call).await?;
            Ok(ImageHandle {
                id: envelope.image.id,
                name: request.name.clone(),
                description: request.description.clone(),
                architecture: request.architecture.clone(),
                root_device: request.root_device.clone(),
                block_map: request.block_map.clone(),
                zone: request.zone.clone(),
            })
        })
    }

    fn image_instance<'a>(
        &'a self,
        request: &'a InstanceImageRequest,
    ) -> BackendFuture<'a, ImageHandle, Self::Error> {
        Box::pin(async move {
            let instance = &request.instance;
            let url = Self::zone_url(&instance.zone, &format!("servers/{}/action", instance.id));
            let call = ApiCall {
                operation: "back up instance",
                kind: "instance",
                resource: &instance.id,
                zone: &instance.zone,
            };
            let body = BackupBody {
                action: "backup",
                name: &request.name,
            };
            let envelope: TaskEnvelope =
                self.send_json(Self::post(&url).json(&body), call).await?;
            let id = backup_image_id(&envelope.task, &instance.id)?;
            debug!(task = %envelope.task.id, image = %id, "backup task started");
            Ok(ImageHandle {
                id,
                name: request.name.clone(),
                description: request.description.clone(),
                architecture: request.architecture.clone(),
                root_device: request.root_device.clone(),
                block_map: BlockDeviceMapping::default(),
                zone: instance.zone.clone(),
            })
        })
    }

    fn publish_image<'a>(&'a self, image: &'a ImageHandle) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = Self::zone_url(&image.zone, &format!("images/{}", image.id));
            let call = ApiCall {
                operation: "publish image",
                kind: "image",
                resource: &image.id,
                zone: &image.zone,
            };
            self.send(Self::patch(&url).json(&PublishImageBody { public: true }), call)
                .await?;
            Ok(())
        })
    }
}
