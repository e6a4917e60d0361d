//! Unit tests for the remote executor.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};
use std::net::{IpAddr, Ipv4Addr};
use tempfile::TempDir;

#[fixture]
fn base_config() -> RemoteConfig {
    RemoteConfig {
        rsync_bin: String::from("rsync"),
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("ubuntu"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: Some(String::from("/keys/rebundle")),
        use_sudo: true,
    }
}

#[fixture]
fn networking() -> InstanceNetworking {
    InstanceNetworking {
        public_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        ssh_port: 2222,
    }
}

fn rendered_args(args: &[OsString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[rstest]
fn run_wraps_command_in_ssh(base_config: RemoteConfig, networking: InstanceNetworking) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let executor = RemoteExecutor::new(base_config, runner.clone())
        .unwrap_or_else(|err| panic!("config should validate: {err}"));

    executor
        .run_checked(&networking, &mount("/dev/sdf", "/data"))
        .unwrap_or_else(|err| panic!("run: {err}"));

    let invocations = runner.invocations();
    let [invocation] = invocations.as_slice() else {
        panic!("expected one invocation, got {invocations:?}");
    };
    assert_eq!(invocation.program, "ssh");
    let args = rendered_args(&invocation.args);
    assert_eq!(
        args,
        vec![
            "-p",
            "2222",
            "-i",
            "/keys/rebundle",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "ubuntu@203.0.113.7",
            "sudo mount /dev/sdf /data",
        ]
    );
}

#[rstest]
fn run_checked_reports_remote_failure(base_config: RemoteConfig, networking: InstanceNetworking) {
    let runner = ScriptedRunner::new();
    runner.push_failure(32);
    let executor = RemoteExecutor::new(base_config, runner)
        .unwrap_or_else(|err| panic!("config should validate: {err}"));

    let err = executor
        .run_checked(&networking, &unmount("/data"))
        .expect_err("non-zero exit should fail");
    let RemoteError::CommandFailure {
        program, status, ..
    } = err
    else {
        panic!("expected CommandFailure, got {err:?}");
    };
    assert_eq!(program, "umount");
    assert_eq!(status, Some(32));
}

#[rstest]
fn list_block_devices_parses_output(base_config: RemoteConfig, networking: InstanceNetworking) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "/dev/sda\n/dev/sdb\n", "");
    let executor = RemoteExecutor::new(base_config, runner)
        .unwrap_or_else(|err| panic!("config should validate: {err}"));

    let devices = executor
        .list_block_devices(&networking)
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert_eq!(devices.len(), 2);
    assert!(devices.contains("/dev/sdb"));
}

#[rstest]
#[case(Some(0), Some(true))]
#[case(Some(1), Some(false))]
#[case(Some(2), None)]
#[case(None, None)]
fn reboot_required_reads_the_exit_code(
    base_config: RemoteConfig,
    networking: InstanceNetworking,
    #[case] code: Option<i32>,
    #[case] expected: Option<bool>,
) {
    let runner = ScriptedRunner::new();
    runner.push_output(code, "", "");
    let executor = RemoteExecutor::new(base_config, runner)
        .unwrap_or_else(|err| panic!("config should validate: {err}"));

    let result = executor.reboot_required(&networking);
    match expected {
        Some(required) => {
            assert_eq!(result.unwrap_or_else(|err| panic!("check: {err}")), required);
        }
        None => assert!(matches!(result, Err(RemoteError::CommandFailure { .. }))),
    }
}

#[rstest]
fn upload_rejects_missing_source(base_config: RemoteConfig, networking: InstanceNetworking) {
    let runner = ScriptedRunner::new();
    let executor = RemoteExecutor::new(base_config, runner.clone())
        .unwrap_or_else(|err| panic!("config should validate: {err}"));

    let err = executor
        .upload(Utf8Path::new("/definitely/not/here"), &networking, "/data")
        .expect_err("missing source should fail");
    assert!(matches!(err, RemoteError::MissingSource { .. }));
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn upload_targets_remote_path_over_ssh(base_config: RemoteConfig, networking: InstanceNetworking) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let executor = RemoteExecutor::new(base_config, runner.clone())
        .unwrap_or_else(|err| panic!("config should validate: {err}"));
    let source_dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let source = Utf8PathBuf::from_path_buf(source_dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));

    executor
        .upload(&source, &networking, "/data")
        .unwrap_or_else(|err| panic!("upload: {err}"));

    let invocations = runner.invocations();
    let [invocation] = invocations.as_slice() else {
        panic!("expected one invocation, got {invocations:?}");
    };
    assert_eq!(invocation.program, "rsync");
    let args = rendered_args(&invocation.args);
    assert!(
        args.iter().any(|arg| arg.starts_with("ssh -p 2222 -i /keys/rebundle")),
        "remote shell should carry ssh options: {args:?}"
    );
    assert_eq!(args.last().map(String::as_str), Some("ubuntu@203.0.113.7:/data"));
}

#[rstest]
fn blank_identity_file_is_rejected(base_config: RemoteConfig) {
    let config = RemoteConfig {
        ssh_identity_file: Some(String::from("  ")),
        ..base_config
    };
    let err = RemoteExecutor::new(config, ScriptedRunner::new())
        .expect_err("blank identity should fail");
    assert_eq!(
        err,
        RemoteError::InvalidConfig {
            field: String::from("ssh_identity_file")
        }
    );
    assert!(err.to_string().contains("REBUNDLE_SSH_SSH_IDENTITY_FILE"));
}
