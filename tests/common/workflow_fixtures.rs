//! Builders for workflows wired to the in-memory backend.
//!
//! ```rust
//! #[path = "common/workflow_fixtures.rs"]
//! mod workflow_fixtures;
//! ```

use camino::Utf8PathBuf;
use rebundle::test_support::{MemoryBackend, ScriptedConfirm, ScriptedRunner};
use rebundle::{
    InstanceRequest, LifecycleConfig, RemoteConfig, RemoteExecutor, VolumeLifecycle, Workflow,
    WorkflowSettings,
};
use tempfile::TempDir;

use super::test_constants::{DEFAULT_INSTANCE_TYPE, TEST_ZONE};

/// Workflow type every behaviour test drives.
pub type TestWorkflow = Workflow<MemoryBackend, ScriptedRunner, ScriptedConfirm>;

/// Test doubles plus the scratch directory holding the handoff file.
pub struct Harness {
    /// Provider double.
    pub backend: MemoryBackend,
    /// Remote command double.
    pub runner: ScriptedRunner,
    /// Operator double.
    pub confirm: ScriptedConfirm,
    /// Handoff file location.
    pub handoff: Utf8PathBuf,
    _scratch: TempDir,
}

impl Harness {
    /// Fresh doubles; the operator answers with `answers` and then yes.
    pub fn new(answers: &[bool]) -> Self {
        let scratch = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
        Self {
            backend: MemoryBackend::new(),
            runner: ScriptedRunner::new(),
            confirm: ScriptedConfirm::answers(answers),
            handoff: root.join("handoff.toml"),
            _scratch: scratch,
        }
    }

    /// Lifecycle settings with small polling budgets and discovery off.
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            volume_size_gb: Some(10),
            source_snapshot: None,
            instance_id: None,
            device: String::from("/dev/sdf"),
            device_discovery: false,
            mount_path: String::from("/data"),
            source_dir: None,
            handoff_file: self.handoff.to_string(),
            create_attempts: 5,
            attach_attempts: 5,
            poll_delay_secs: 1,
            snapshot_attempts: 5,
            snapshot_delay_secs: 1,
            root_device: String::from("/dev/sda1"),
            ephemeral_devices: vec![String::from("/dev/sdb"), String::from("/dev/sdc")],
            kernel_id: None,
        }
    }

    /// Builds a workflow over clones of the doubles.
    pub fn workflow(&self, lifecycle: LifecycleConfig) -> TestWorkflow {
        let remote = RemoteExecutor::new(remote_config(), self.runner.clone())
            .unwrap_or_else(|err| panic!("remote executor: {err}"));
        let orchestrator = VolumeLifecycle::new(self.backend.clone(), remote, lifecycle.policy());
        let settings = WorkflowSettings {
            instance: instance_request(),
            lifecycle,
        };
        Workflow::new(orchestrator, settings, self.confirm.clone())
    }

    /// Queues the responses of a successful format, mkdir, empty check,
    /// mount, and chown.
    pub fn script_fresh_mount(&self) {
        self.runner.push_success();
        self.runner.push_success();
        self.runner.push_stdout("");
        self.runner.push_success();
        self.runner.push_success();
    }
}

/// SSH settings that never touch the host.
pub fn remote_config() -> RemoteConfig {
    RemoteConfig {
        rsync_bin: String::from("rsync"),
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("ubuntu"),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        use_sudo: true,
    }
}

/// Instance created when no existing one is configured.
pub fn instance_request() -> InstanceRequest {
    InstanceRequest {
        image_label: String::from("Ubuntu 24.04 Noble Numbat"),
        instance_type: String::from(DEFAULT_INSTANCE_TYPE),
        zone: String::from(TEST_ZONE),
        project_id: String::from("proj"),
        organisation_id: None,
        architecture: String::from("x86_64"),
    }
}
