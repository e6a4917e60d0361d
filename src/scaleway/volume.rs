//! Block volumes through the Instance API.
//!
//! Scaleway reports an attached volume as `available` with a `server`
//! reference, so attachment is read from the reference rather than the state
//! token. Sizes travel in bytes.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendFuture, InstanceHandle};
use crate::volume::{VolumeBackend, VolumeHandle, VolumeRequest, VolumeState};

use super::http::ApiCall;
use super::{ScalewayBackend, ScalewayBackendError};

const BYTES_PER_GB: u64 = 1_000_000_000;

pub(super) const fn gb_to_bytes(size_gb: u64) -> u64 {
    size_gb.saturating_mul(BYTES_PER_GB)
}

pub(super) const fn bytes_to_gb(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(BYTES_PER_GB)
}

#[derive(Debug, Serialize)]
pub(super) struct CreateVolumeBody<'a> {
    pub(super) name: &'a str,
    pub(super) project: &'a str,
    pub(super) volume_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) base_snapshot: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) organization: Option<&'a str>,
    pub(super) tags: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct VolumeIdBody<'a> {
    volume_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeEnvelope {
    pub(super) volume: ScalewayVolume,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerRef {
    pub(super) id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ScalewayVolume {
    pub(super) id: String,
    pub(super) zone: String,
    pub(super) size: u64,
    pub(super) state: String,
    #[serde(default)]
    pub(super) server: Option<ServerRef>,
}

impl ScalewayVolume {
    pub(super) fn into_handle(self) -> VolumeHandle {
        let reported = VolumeState::from_provider(&self.state);
        let state = if reported == VolumeState::Available && self.server.is_some() {
            VolumeState::InUse
        } else {
            reported
        };
        VolumeHandle {
            id: self.id,
            zone: self.zone,
            size_gb: bytes_to_gb(self.size),
            state,
            device: None,
            instance_id: self.server.map(|server| server.id),
        }
    }
}

impl ScalewayBackend {
    async fn server_volume_action(
        &self,
        handle: &InstanceHandle,
        volume_id: &str,
        action: &'static str,
    ) -> Result<(), ScalewayBackendError> {
        let url = Self::zone_url(&handle.zone, &format!("servers/{}/{action}", handle.id));
        let call = ApiCall {
            operation: action,
            kind: "server",
            resource: &handle.id,
            zone: &handle.zone,
        };
        self.send(Self::post(&url).json(&VolumeIdBody { volume_id }), call)
            .await?;
        Ok(())
    }
}

impl VolumeBackend for ScalewayBackend {
    fn create_volume<'a>(
        &'a self,
        request: &'a VolumeRequest,
    ) -> BackendFuture<'a, VolumeHandle, Self::Error> {
        Box::pin(async move {
            let body = CreateVolumeBody {
                name: &request.name,
                project: &request.project_id,
                volume_type: &self.config.default_volume_type,
                size: request.size_gb.map(gb_to_bytes),
                base_snapshot: request.source_snapshot.as_deref(),
                organization: request.organisation_id.as_deref(),
                tags: vec!["rebundle"],
            };
            let url = Self::zone_url(&request.zone, "volumes");
            let call = ApiCall {
                operation: "create volume",
                kind: "volume",
                resource: &request.name,
                zone: &request.zone,
            };
            let envelope: VolumeEnvelope =
                self.send_json(Self::post(&url).json(&body), call).await?;
            Ok(envelope.volume.into_handle())
        })
    }

    fn describe_volume<'a>(
        &'a self,
        zone: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, VolumeHandle, Self::Error> {
        Box::pin(async move {
            let url = Self::zone_url(zone, &format!("volumes/{volume_id}"));
            let call = ApiCall {
                operation: "describe volume",
                kind: "volume",
                resource: volume_id,
                zone,
            };
            let envelope: VolumeEnvelope = self.send_json(Self::get(&url), call).await?;
            Ok(envelope.volume.into_handle())
        })
    }

    fn attach_volume<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        volume_id: &'a str,
        _device: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.server_volume_action(handle, volume_id, "attach-volume")
                .await
        })
    }

    fn detach_volume<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.server_volume_action(handle, volume_id, "detach-volume")
                .await
        })
    }

    fn delete_volume<'a>(
        &'a self,
        zone: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = Self::zone_url(zone, &format!("volumes/{volume_id}"));
            let call = ApiCall {
                operation: "delete volume",
                kind: "volume",
                resource: volume_id,
                zone,
            };
            self.send(Self::delete(&url), call).await?;
            Ok(())
        })
    }
}
