//! Unit tests for the Scaleway backend's payloads and response mapping.

use super::http::{ApiCall, check_status};
use super::image::{BackupBody, ExtraVolume, ServerTask, backup_image_id, image_body};
use super::instance::select_image_id;
use super::snapshot::SnapshotEnvelope;
use super::volume::{CreateVolumeBody, VolumeEnvelope, gb_to_bytes};
use super::*;
use crate::image::{BlockDevice, BlockDeviceMapping, ImageRequest};
use crate::snapshot::SnapshotStatus;
use crate::volume::VolumeState;
use reqwest::StatusCode;
use rstest::rstest;
use scaleway_rs::ScalewayImage;
use std::collections::HashMap;

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn dummy_config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("dummy"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Ubuntu"),
        default_architecture: String::from("x86_64"),
        default_volume_type: String::from("b_ssd"),
    }
}

fn base_request() -> InstanceRequest {
    InstanceRequest {
        image_label: "Ubuntu".to_owned(),
        instance_type: "DEV1-S".to_owned(),
        zone: "fr-par-1".to_owned(),
        project_id: "proj".to_owned(),
        organisation_id: None,
        architecture: "x86_64".to_owned(),
    }
}

fn backend_fixture() -> ScalewayBackend {
    ScalewayBackend::new(dummy_config()).unwrap_or_else(|err| panic!("backend: {err}"))
}

const CALL: ApiCall<'static> = ApiCall {
    operation: "describe volume",
    kind: "volume",
    resource: "vol-1",
    zone: "fr-par-1",
};

#[test]
fn not_found_status_maps_to_not_found() {
    let err = check_status(CALL, StatusCode::NOT_FOUND, b"{}").expect_err("404");
    assert_eq!(
        err.to_string(),
        "volume vol-1 not found in zone fr-par-1"
    );
}

#[test]
fn error_status_carries_body() {
    let err = check_status(CALL, StatusCode::CONFLICT, b" volume is in use\n").expect_err("409");
    assert_eq!(
        err,
        ScalewayBackendError::Api {
            operation: "describe volume",
            resource: String::from("vol-1"),
            status: 409,
            message: String::from("volume is in use"),
        }
    );
}

#[rstest]
#[case(r#"{"volume":{"id":"vol-1","zone":"fr-par-1","size":20000000000,"state":"available","server":null}}"#, VolumeState::Available, None)]
#[case(r#"{"volume":{"id":"vol-1","zone":"fr-par-1","size":20000000000,"state":"available","server":{"id":"srv-1","name":"x"}}}"#, VolumeState::InUse, Some("srv-1"))]
#[case(r#"{"volume":{"id":"vol-1","zone":"fr-par-1","size":20000000000,"state":"hotsyncing","server":{"id":"srv-1"}}}"#, VolumeState::Attaching, Some("srv-1"))]
fn volume_responses_map_attachment(
    #[case] body: &str,
    #[case] state: VolumeState,
    #[case] instance: Option<&str>,
) {
    let envelope: VolumeEnvelope =
        serde_json::from_str(body).unwrap_or_else(|err| panic!("parse: {err}"));
    let handle = envelope.volume.into_handle();
    assert_eq!(handle.state, state);
    assert_eq!(handle.instance_id.as_deref(), instance);
    assert_eq!(handle.size_gb, 20);
}

#[test]
fn partial_gigabytes_round_up() {
    let body = r#"{"volume":{"id":"vol-1","zone":"fr-par-1","size":10000000001,"state":"available"}}"#;
    let envelope: VolumeEnvelope =
        serde_json::from_str(body).unwrap_or_else(|err| panic!("parse: {err}"));
    assert_eq!(envelope.volume.into_handle().size_gb, 11);
}

#[test]
fn restore_body_names_base_snapshot() {
    let body = CreateVolumeBody {
        name: "data",
        project: "proj",
        volume_type: "b_ssd",
        size: Some(gb_to_bytes(20)),
        base_snapshot: Some("snap-1"),
        organization: None,
        tags: vec!["rebundle"],
    };
    let json = serde_json::to_value(&body).unwrap_or_else(|err| panic!("serialise: {err}"));
    assert_eq!(json["size"], 20_000_000_000_u64);
    assert_eq!(json["base_snapshot"], "snap-1");
    assert!(json.get("organization").is_none());
}

#[rstest]
#[case("snapshotting", SnapshotStatus::Pending, 0)]
#[case("available", SnapshotStatus::Completed, 100)]
#[case("error", SnapshotStatus::Error, 0)]
fn snapshot_progress_follows_state(
    #[case] state: &str,
    #[case] status: SnapshotStatus,
    #[case] progress: u8,
) {
    let body = format!(
        r#"{{"snapshot":{{"id":"snap-1","name":"nightly","zone":"fr-par-1","state":"{state}","size":5000000000,"base_volume":{{"id":"vol-1","name":"data"}}}}}}"#
    );
    let envelope: SnapshotEnvelope =
        serde_json::from_str(&body).unwrap_or_else(|err| panic!("parse: {err}"));
    let handle = envelope.snapshot.into_handle();
    assert_eq!(handle.status, status);
    assert_eq!(handle.progress, progress);
    assert_eq!(handle.volume_id, "vol-1");
    assert_eq!(handle.size_gb, 5);
}

#[test]
fn image_body_skips_ephemeral_slots() {
    let mut block_map = BlockDeviceMapping::for_root_snapshot(
        "/dev/sda1",
        "snap-root",
        &[String::from("/dev/sdb")],
    )
    .unwrap_or_else(|err| panic!("mapping: {err}"));
    block_map
        .insert(
            "/dev/sdc",
            BlockDevice::Snapshot {
                snapshot_id: String::from("snap-extra"),
                delete_on_termination: true,
            },
        )
        .unwrap_or_else(|err| panic!("insert: {err}"));
    let request = ImageRequest {
        name: String::from("rebundled"),
        description: String::new(),
        architecture: String::from("x86_64"),
        kernel_id: None,
        root_device: String::from("/dev/sda1"),
        block_map,
        zone: String::from("fr-par-1"),
        project_id: String::from("proj"),
    };

    let body = image_body(&request).unwrap_or_else(|err| panic!("body: {err}"));

    assert_eq!(body.root_volume, "snap-root");
    assert_eq!(body.extra_volumes.len(), 1);
    assert_eq!(
        body.extra_volumes.get("1"),
        Some(&ExtraVolume {
            id: String::from("snap-extra")
        })
    );
    assert!(!body.public);
}

#[test]
fn backup_body_names_the_image() {
    let body = BackupBody {
        action: "backup",
        name: "rebundled",
    };
    let json = serde_json::to_value(&body).unwrap_or_else(|err| panic!("json: {err}"));
    assert_eq!(json, serde_json::json!({"action": "backup", "name": "rebundled"}));
}

#[rstest]
#[case(Some("/images/img-42"), Ok("img-42"))]
#[case(Some("https://api.scaleway.com/instance/v1/zones/fr-par-1/images/img-7/"), Ok("img-7"))]
#[case(Some("/servers/srv-1"), Err(()))]
#[case(None, Err(()))]
fn backup_task_result_names_image(
    #[case] href: Option<&str>,
    #[case] expected: Result<&str, ()>,
) {
    let task = ServerTask {
        id: String::from("task-1"),
        href_result: href.map(str::to_owned),
    };
    let result = backup_image_id(&task, "srv-1");
    match expected {
        Ok(id) => assert_eq!(result.unwrap_or_else(|err| panic!("image id: {err}")), id),
        Err(()) => assert!(matches!(result, Err(ScalewayBackendError::Validation(_)))),
    }
}

#[test]
fn select_image_prefers_newest_available_match() {
    let request = base_request();
    let chosen = select_image_id(
        vec![
            image("old", "x86_64", "available", "2024-01-01"),
            image("new", "x86_64", "available", "2025-01-01"),
            image("arm", "arm64", "available", "2026-01-01"),
            image("broken", "x86_64", "error", "2026-02-01"),
        ],
        &request,
    )
    .unwrap_or_else(|err| panic!("select: {err}"));
    assert_eq!(chosen, "new");
}

#[test]
fn select_image_reports_missing_label() {
    let err = select_image_id(Vec::new(), &base_request()).expect_err("no images");
    assert!(matches!(err, ScalewayBackendError::ImageNotFound { .. }));
}

#[tokio::test]
async fn power_on_is_skipped_for_running_instances() {
    let view = InstanceView {
        id: String::from("srv-1"),
        state: String::from("running"),
        allowed_actions: vec![],
        public_ip: Some(String::from("192.0.2.1")),
    };
    let result = backend_fixture().power_on_if_needed("fr-par-1", &view).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn power_on_errors_when_not_allowed() {
    let view = InstanceView {
        id: String::from("srv-1"),
        state: String::from("locked"),
        allowed_actions: vec![],
        public_ip: None,
    };
    let result = backend_fixture().power_on_if_needed("fr-par-1", &view).await;
    assert!(matches!(
        result,
        Err(ScalewayBackendError::ActionNotAllowed {
            action: "poweron",
            ..
        })
    ));
}

#[rstest]
#[case(&["poweroff", "reboot", "backup"], "reboot", true)]
#[case(&["poweron"], "reboot", false)]
#[case(&["poweroff", "reboot"], "backup", false)]
fn allowed_actions_gate_instance_actions(
    #[case] allowed: &[&str],
    #[case] action: &'static str,
    #[case] expected: bool,
) {
    let view = InstanceView {
        id: String::from("srv-1"),
        state: String::from("running"),
        allowed_actions: allowed.iter().map(|name| (*name).to_owned()).collect(),
        public_ip: Some(String::from("192.0.2.1")),
    };
    assert_eq!(view.ensure_allowed(action).is_ok(), expected);
}

#[test]
fn blank_secret_key_is_rejected() {
    let config = ScalewayConfig {
        secret_key: String::from("  "),
        ..dummy_config()
    };
    let err = ScalewayBackend::new(config)
        .err()
        .unwrap_or_else(|| panic!("blank key accepted"));
    assert!(err.to_string().contains("SCW_SECRET_KEY"));
}
