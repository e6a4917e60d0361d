//! Unit tests for the volume lifecycle orchestrator.

use super::*;
use crate::image::BlockDeviceMapping;
use crate::remote::RemoteConfig;
use crate::test_support::{MEMORY_INSTANCE_IP, MemoryBackend, MemoryOperation, ScriptedRunner};
use rstest::{fixture, rstest};
use std::time::Duration;

type Lifecycle = VolumeLifecycle<MemoryBackend, ScriptedRunner>;

fn remote_config() -> RemoteConfig {
    RemoteConfig {
        rsync_bin: String::from("rsync"),
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("root"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        use_sudo: true,
    }
}

fn fast_policy(device_discovery: bool) -> LifecyclePolicy {
    let policy = PollPolicy::new(5, Duration::from_secs(1));
    LifecyclePolicy {
        create: policy,
        attach: policy,
        detach: policy,
        snapshot: policy,
        device_discovery,
    }
}

fn lifecycle(
    backend: &MemoryBackend,
    runner: &ScriptedRunner,
    device_discovery: bool,
) -> Lifecycle {
    let remote = RemoteExecutor::new(remote_config(), runner.clone())
        .unwrap_or_else(|err| panic!("remote executor: {err}"));
    VolumeLifecycle::new(backend.clone(), remote, fast_policy(device_discovery))
}

#[fixture]
fn instance() -> InstanceHandle {
    InstanceHandle {
        id: String::from("srv-existing"),
        zone: String::from("fr-par-1"),
    }
}

#[fixture]
fn networking() -> InstanceNetworking {
    InstanceNetworking {
        public_ip: MEMORY_INSTANCE_IP,
        ssh_port: 22,
    }
}

fn request(size_gb: Option<u64>) -> VolumeRequest {
    VolumeRequest::new("rebundle-data", "fr-par-1", "proj").size_gb(size_gb)
}

fn completed_snapshot(id: &str, size_gb: u64) -> SnapshotHandle {
    SnapshotHandle {
        id: id.to_owned(),
        zone: String::from("fr-par-1"),
        volume_id: String::from("vol-old"),
        status: SnapshotStatus::Completed,
        progress: 100,
        description: String::new(),
        size_gb,
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn full_cycle_reaches_deleted(instance: InstanceHandle, networking: InstanceNetworking) {
    let backend = MemoryBackend::new();
    backend.insert_instance(instance.clone());
    let runner = ScriptedRunner::new();
    runner.push_stdout("/dev/vda\n");
    runner.push_stdout("/dev/vda\n/dev/vdb\n");
    let mut lifecycle = lifecycle(&backend, &runner, true);

    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    assert_eq!(volume.state, VolumeState::Available);
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Available));

    let attached = lifecycle
        .attach(&volume, &instance, &networking, "/dev/sdf")
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));
    assert_eq!(attached.device, "/dev/vdb");
    assert_eq!(attached.requested, "/dev/sdf");
    assert!(attached.volume.state.is_attached());

    let detached = lifecycle
        .detach(&attached.volume, &instance)
        .await
        .unwrap_or_else(|err| panic!("detach: {err}"));
    assert_eq!(detached.state, VolumeState::Available);

    let snapshot = lifecycle
        .snapshot(&detached, "nightly")
        .await
        .unwrap_or_else(|err| panic!("snapshot: {err}"));
    assert!(snapshot.is_complete());
    assert_eq!(backend.calls(MemoryOperation::DescribeSnapshot), 3);
    assert_eq!(
        lifecycle.phase(&volume.id),
        Some(VolumePhase::SnapshotReady)
    );

    let deleted = lifecycle
        .delete(&detached)
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));
    assert!(deleted);
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Deleted));
    assert!(backend.volume(&volume.id).is_none());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn attach_without_discovery_uses_reported_device(
    instance: InstanceHandle,
    networking: InstanceNetworking,
) {
    let backend = MemoryBackend::new();
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    let attached = lifecycle
        .attach(&volume, &instance, &networking, "/dev/sdf")
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    assert_eq!(attached.device, "/dev/sdf");
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn attach_times_out_and_marks_failed(
    instance: InstanceHandle,
    networking: InstanceNetworking,
) {
    let backend = MemoryBackend::new();
    backend.set_attach_script(vec![VolumeState::Attaching]);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    let describes_before = backend.calls(MemoryOperation::DescribeVolume);

    let err = lifecycle
        .attach(&volume, &instance, &networking, "/dev/sdf")
        .await
        .expect_err("attach should time out");

    match err {
        LifecycleError::Timeout {
            attempts,
            last_status,
            ..
        } => {
            assert_eq!(attempts, 5);
            assert_eq!(last_status.as_deref(), Some("attaching"));
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert_eq!(
        backend.calls(MemoryOperation::DescribeVolume) - describes_before,
        5
    );
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Failed));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn attach_rejects_volume_in_error(
    instance: InstanceHandle,
    networking: InstanceNetworking,
) {
    let backend = MemoryBackend::new();
    backend.set_attach_script(vec![VolumeState::Attaching, VolumeState::Error]);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    let err = lifecycle
        .attach(&volume, &instance, &networking, "/dev/sdf")
        .await
        .expect_err("error state is terminal");

    assert!(matches!(err, LifecycleError::Rejected { ref status, .. } if status == "error"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn second_attach_is_an_illegal_transition(
    instance: InstanceHandle,
    networking: InstanceNetworking,
) {
    let backend = MemoryBackend::new();
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    let attached = lifecycle
        .attach(&volume, &instance, &networking, "/dev/sdf")
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    let err = lifecycle
        .attach(&attached.volume, &instance, &networking, "/dev/sdg")
        .await
        .expect_err("already attached");

    assert!(matches!(err, LifecycleError::Transition(_)));
    assert_eq!(backend.calls(MemoryOperation::AttachVolume), 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_requires_available_volume() {
    let backend = MemoryBackend::new();
    backend.insert_volume(VolumeHandle {
        id: String::from("vol-busy"),
        zone: String::from("fr-par-1"),
        size_gb: 10,
        state: VolumeState::InUse,
        device: Some(String::from("/dev/sdf")),
        instance_id: Some(String::from("srv-1")),
    });
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = backend
        .volume("vol-busy")
        .unwrap_or_else(|| panic!("seeded volume missing"));

    let err = lifecycle
        .snapshot(&volume, "busy")
        .await
        .expect_err("attached volumes cannot be snapshotted");

    assert!(matches!(err, LifecycleError::Precondition(_)));
    assert_eq!(backend.calls(MemoryOperation::CreateSnapshot), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_grows_volume_to_snapshot_size() {
    let backend = MemoryBackend::new();
    backend.insert_snapshot(completed_snapshot("snap-base", 20));
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);

    let volume = lifecycle
        .create_volume(&request(Some(5)).source_snapshot(Some(String::from("snap-base"))))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(volume.size_gb, 20);
}

#[tokio::test(start_paused = true)]
async fn restore_refuses_incomplete_snapshot() {
    let backend = MemoryBackend::new();
    backend.insert_snapshot(SnapshotHandle {
        status: SnapshotStatus::Pending,
        progress: 40,
        ..completed_snapshot("snap-wip", 20)
    });
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);

    let err = lifecycle
        .create_volume(&request(None).source_snapshot(Some(String::from("snap-wip"))))
        .await
        .expect_err("incomplete snapshot");

    assert!(matches!(err, LifecycleError::Precondition(_)));
    assert_eq!(backend.calls(MemoryOperation::CreateVolume), 0);
}

#[tokio::test(start_paused = true)]
async fn undersized_restore_is_rejected() {
    let backend = MemoryBackend::new();
    backend.insert_snapshot(completed_snapshot("snap-base", 20));
    backend.set_created_size(Some(8));
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);

    let err = lifecycle
        .create_volume(&request(None).source_snapshot(Some(String::from("snap-base"))))
        .await
        .expect_err("provider returned a smaller volume");

    assert!(err.to_string().contains("smaller than its 20 GB source snapshot"));
}

#[rstest]
#[case(None)]
#[case(Some(0))]
#[tokio::test(start_paused = true)]
async fn create_requires_positive_size(#[case] size_gb: Option<u64>) {
    let backend = MemoryBackend::new();
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);

    let err = lifecycle
        .create_volume(&request(size_gb))
        .await
        .expect_err("size required");

    assert!(matches!(err, LifecycleError::Precondition(_)));
}

#[tokio::test(start_paused = true)]
async fn delete_failure_is_reported_not_raised() {
    let backend = MemoryBackend::new();
    backend.fail_on(MemoryOperation::DeleteVolume);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    let deleted = lifecycle
        .delete(&volume)
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));

    assert!(!deleted);
    assert!(backend.volume(&volume.id).is_some());
}

#[tokio::test(start_paused = true)]
async fn register_requires_completed_root_snapshot() {
    let backend = MemoryBackend::new();
    backend.insert_snapshot(SnapshotHandle {
        status: SnapshotStatus::Completed,
        progress: 90,
        ..completed_snapshot("snap-root", 10)
    });
    let runner = ScriptedRunner::new();
    let lifecycle = lifecycle(&backend, &runner, false);
    let block_map = BlockDeviceMapping::for_root_snapshot("/dev/sda1", "snap-root", &[])
        .unwrap_or_else(|err| panic!("mapping: {err}"));
    let image = ImageRequest {
        name: String::from("rebundled"),
        description: String::new(),
        architecture: String::from("x86_64"),
        kernel_id: None,
        root_device: String::from("/dev/sda1"),
        block_map,
        zone: String::from("fr-par-1"),
        project_id: String::from("proj"),
    };

    let err = lifecycle
        .register_image(&image)
        .await
        .expect_err("snapshot not at 100%");

    assert!(matches!(err, LifecycleError::Registration(_)));
    assert_eq!(backend.calls(MemoryOperation::RegisterImage), 0);
}

fn available_volume(backend: &MemoryBackend, id: &str) -> VolumeHandle {
    let volume = VolumeHandle {
        id: id.to_owned(),
        zone: String::from("fr-par-1"),
        size_gb: 10,
        state: VolumeState::Available,
        device: None,
        instance_id: None,
    };
    backend.insert_volume(volume.clone());
    volume
}

#[tokio::test(start_paused = true)]
async fn requested_volume_is_tracked_before_it_is_available() {
    let backend = MemoryBackend::new();
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);

    let pending = lifecycle
        .request_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("request: {err}"));
    assert_eq!(
        lifecycle.phase(&pending.volume.id),
        Some(VolumePhase::Creating)
    );
    assert!(backend.volume(&pending.volume.id).is_some());
    assert_eq!(backend.calls(MemoryOperation::DescribeVolume), 0);

    let volume = lifecycle
        .await_volume(&pending)
        .await
        .unwrap_or_else(|err| panic!("await: {err}"));
    assert_eq!(volume.state, VolumeState::Available);
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Available));
}

#[tokio::test(start_paused = true)]
async fn completed_status_below_full_progress_keeps_polling() {
    let backend = MemoryBackend::new();
    backend.set_snapshot_script(vec![
        (SnapshotStatus::Completed, 80),
        (SnapshotStatus::Completed, 100),
    ]);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = available_volume(&backend, "vol-1");

    let snapshot = lifecycle
        .snapshot(&volume, "nightly")
        .await
        .unwrap_or_else(|err| panic!("snapshot: {err}"));

    assert_eq!(snapshot.progress, 100);
    assert_eq!(backend.calls(MemoryOperation::DescribeSnapshot), 2);
    assert_eq!(
        lifecycle.phase(&volume.id),
        Some(VolumePhase::SnapshotReady)
    );
}

#[tokio::test(start_paused = true)]
async fn snapshot_error_status_is_rejected_once() {
    let backend = MemoryBackend::new();
    backend.set_snapshot_script(vec![
        (SnapshotStatus::Pending, 0),
        (SnapshotStatus::Error, 0),
    ]);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = available_volume(&backend, "vol-1");

    let err = lifecycle
        .snapshot(&volume, "nightly")
        .await
        .expect_err("error status is terminal");

    assert!(
        matches!(
            err,
            LifecycleError::Rejected { operation: "create snapshot", ref status, .. }
                if status == "error"
        ),
        "unexpected error: {err}"
    );
    assert_eq!(err.to_string(), "create snapshot on snap-1 ended in status error");
    assert_eq!(backend.calls(MemoryOperation::DescribeSnapshot), 2);
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Failed));
}

#[tokio::test(start_paused = true)]
async fn snapshot_timeout_reports_last_status() {
    let backend = MemoryBackend::new();
    backend.set_snapshot_script(vec![(SnapshotStatus::Pending, 10)]);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = available_volume(&backend, "vol-1");

    let err = lifecycle
        .snapshot(&volume, "nightly")
        .await
        .expect_err("snapshot never completes");

    let LifecycleError::Timeout {
        attempts,
        last_status,
        ..
    } = err
    else {
        panic!("expected timeout, got {err}");
    };
    assert_eq!(attempts, 5);
    assert_eq!(last_status.as_deref(), Some("pending"));
}

#[tokio::test(start_paused = true)]
async fn snapshot_status_failure_is_a_poll_fetch_error() {
    let backend = MemoryBackend::new();
    backend.fail_on(MemoryOperation::DescribeSnapshot);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = available_volume(&backend, "vol-1");

    let err = lifecycle
        .snapshot(&volume, "nightly")
        .await
        .expect_err("status fetch fails");

    assert!(
        matches!(
            err,
            LifecycleError::PollFetch {
                operation: "create snapshot",
                attempt: 1,
                ..
            }
        ),
        "unexpected error: {err}"
    );
    assert_eq!(backend.calls(MemoryOperation::DescribeSnapshot), 1);
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Failed));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn detach_times_out_and_marks_failed(
    instance: InstanceHandle,
    networking: InstanceNetworking,
) {
    let backend = MemoryBackend::new();
    backend.set_detach_script(vec![VolumeState::Detaching]);
    let runner = ScriptedRunner::new();
    let mut lifecycle = lifecycle(&backend, &runner, false);
    let volume = lifecycle
        .create_volume(&request(Some(10)))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    let attached = lifecycle
        .attach(&volume, &instance, &networking, "/dev/sdf")
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    let err = lifecycle
        .detach(&attached.volume, &instance)
        .await
        .expect_err("detach should time out");

    assert!(
        matches!(
            err,
            LifecycleError::Timeout { operation: "detach volume", ref last_status, .. }
                if last_status.as_deref() == Some("detaching")
        ),
        "unexpected error: {err}"
    );
    assert_eq!(lifecycle.phase(&volume.id), Some(VolumePhase::Failed));
}

#[tokio::test(start_paused = true)]
async fn publishing_is_skipped_when_snapshots_cannot_be_shared() {
    let backend = MemoryBackend::new();
    backend.insert_snapshot(completed_snapshot("snap-1", 10));
    let runner = ScriptedRunner::new();
    let lifecycle = lifecycle(&backend, &runner, false);

    let published = lifecycle
        .publish_snapshot(&completed_snapshot("snap-1", 10))
        .await
        .unwrap_or_else(|err| panic!("publish: {err}"));

    assert!(!published);
    assert_eq!(backend.calls(MemoryOperation::PublishSnapshot), 0);
}

#[rstest]
#[case(100, true)]
#[case(60, false)]
#[tokio::test]
async fn only_completed_snapshots_are_published(#[case] progress: u8, #[case] allowed: bool) {
    let backend = MemoryBackend::new();
    backend.share_snapshots();
    let snapshot = SnapshotHandle {
        progress,
        ..completed_snapshot("snap-1", 10)
    };
    backend.insert_snapshot(snapshot.clone());
    let runner = ScriptedRunner::new();
    let lifecycle = lifecycle(&backend, &runner, false);

    let result = lifecycle.publish_snapshot(&snapshot).await;

    if allowed {
        assert!(result.unwrap_or_else(|err| panic!("publish: {err}")));
    } else {
        assert!(matches!(result, Err(LifecycleError::Precondition(_))));
    }
    assert_eq!(backend.is_snapshot_public("snap-1"), allowed);
}
