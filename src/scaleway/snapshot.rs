//! Volume snapshots through the Instance API.
//!
//! The API reports no copy progress; it is reported as 100% once the
//! snapshot is available and 0% before. Instance snapshots are scoped to
//! their project and cannot be shared; images can.

use serde::{Deserialize, Serialize};

use crate::backend::BackendFuture;
use crate::snapshot::{PROGRESS_COMPLETE, SnapshotBackend, SnapshotHandle, SnapshotStatus};

use super::http::ApiCall;
use super::volume::bytes_to_gb;
use super::ScalewayBackend;
use super::error::ScalewayBackendError;

#[derive(Debug, Serialize)]
pub(super) struct CreateSnapshotBody<'a> {
    pub(super) name: &'a str,
    pub(super) volume_id: &'a str,
    pub(super) project: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) organization: Option<&'a str>,
    pub(super) tags: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SnapshotEnvelope {
    pub(super) snapshot: ScalewaySnapshot,
}

#[derive(Debug, Deserialize)]
pub(super) struct BaseVolumeRef {
    pub(super) id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ScalewaySnapshot {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) zone: String,
    pub(super) state: String,
    pub(super) size: u64,
    #[serde(default)]
    pub(super) base_volume: Option<BaseVolumeRef>,
}

impl ScalewaySnapshot {
    pub(super) fn into_handle(self) -> SnapshotHandle {
        let status = SnapshotStatus::from_provider(&self.state);
        let progress = if status == SnapshotStatus::Completed {
            PROGRESS_COMPLETE
        } else {
            0
        };
        SnapshotHandle {
            id: self.id,
            zone: self.zone,
            volume_id: self.base_volume.map(|volume| volume.id).unwrap_or_default(),
            status,
            progress,
            description: self.name,
            size_gb: bytes_to_gb(self.size),
        }
    }
}

impl SnapshotBackend for ScalewayBackend {
    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        volume_id: &'a str,
        description: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, Self::Error> {
        Box::pin(async move {
            let body = CreateSnapshotBody {
                name: description,
                volume_id,
                project: &self.config.default_project_id,
                organization: self.config.default_organization_id.as_deref(),
                tags: vec!["rebundle"],
            };
            let url = Self::zone_url(zone, "snapshots");
            let call = ApiCall {
                operation: "create snapshot",
                kind: "volume",
                resource: volume_id,
                zone,
            };
            let envelope: SnapshotEnvelope =
                self.send_json(Self::post(&url).json(&body), call).await?;
            Ok(envelope.snapshot.into_handle())
        })
    }

    fn describe_snapshot<'a>(
        &'a self,
        zone: &'a str,
        snapshot_id: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, Self::Error> {
        Box::pin(async move {
            let url = Self::zone_url(zone, &format!("snapshots/{snapshot_id}"));
            let call = ApiCall {
                operation: "describe snapshot",
                kind: "snapshot",
                resource: snapshot_id,
                zone,
            };
            let envelope: SnapshotEnvelope = self.send_json(Self::get(&url), call).await?;
            Ok(envelope.snapshot.into_handle())
        })
    }

    fn supports_public_snapshots(&self) -> bool {
        false
    }

    fn publish_snapshot<'a>(
        &'a self,
        snapshot: &'a SnapshotHandle,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            Err(ScalewayBackendError::Validation(format!(
                "snapshot {} cannot be made public; register an image from it instead",
                snapshot.id
            )))
        })
    }
}
