//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::future;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::backend::{
    Backend, BackendFuture, InstanceDescription, InstanceHandle, InstanceNetworking,
    InstanceRequest, InstanceState,
};
use crate::confirm::{Confirm, ConfirmError};
use crate::image::{
    BlockDeviceMapping, ImageBackend, ImageHandle, ImageRequest, InstanceImageRequest,
};
use crate::remote::{CommandOutput, CommandRunner, RemoteError};
use crate::snapshot::{SnapshotBackend, SnapshotHandle, SnapshotStatus};
use crate::volume::{VolumeBackend, VolumeHandle, VolumeRequest, VolumeState};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| RemoteError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Confirmation double that replays queued answers and records prompts.
///
/// Once the queue is empty every prompt gets the fallback answer.
#[derive(Clone, Debug)]
pub struct ScriptedConfirm {
    answers: Rc<RefCell<VecDeque<bool>>>,
    prompts: Rc<RefCell<Vec<String>>>,
    fallback: bool,
}

impl ScriptedConfirm {
    /// Answers every prompt with `answer`.
    #[must_use]
    pub fn always(answer: bool) -> Self {
        Self {
            answers: Rc::default(),
            prompts: Rc::default(),
            fallback: answer,
        }
    }

    /// Replays `answers` in order, then says yes.
    #[must_use]
    pub fn answers(answers: &[bool]) -> Self {
        let confirm = Self::always(true);
        confirm.answers.borrow_mut().extend(answers.iter().copied());
        confirm
    }

    /// Prompts shown so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool, ConfirmError> {
        self.prompts.borrow_mut().push(prompt.to_owned());
        Ok(self
            .answers
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.fallback))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Provider calls made against [`MemoryBackend`].
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum MemoryOperation {
    /// `Backend::create`.
    CreateInstance,
    /// `Backend::wait_for_ready`.
    WaitForReady,
    /// `Backend::describe_instance`.
    DescribeInstance,
    /// `Backend::reboot`.
    RebootInstance,
    /// `Backend::destroy`.
    DestroyInstance,
    /// `VolumeBackend::create_volume`.
    CreateVolume,
    /// `VolumeBackend::describe_volume`.
    DescribeVolume,
    /// `VolumeBackend::attach_volume`.
    AttachVolume,
    /// `VolumeBackend::detach_volume`.
    DetachVolume,
    /// `VolumeBackend::delete_volume`.
    DeleteVolume,
    /// `SnapshotBackend::create_snapshot`.
    CreateSnapshot,
    /// `SnapshotBackend::describe_snapshot`.
    DescribeSnapshot,
    /// `SnapshotBackend::publish_snapshot`.
    PublishSnapshot,
    /// `ImageBackend::register_image`.
    RegisterImage,
    /// `ImageBackend::image_instance`.
    ImageInstance,
    /// `ImageBackend::publish_image`.
    PublishImage,
}

impl fmt::Display for MemoryOperation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CreateInstance => "create instance",
            Self::WaitForReady => "wait for ready",
            Self::DescribeInstance => "describe instance",
            Self::RebootInstance => "reboot instance",
            Self::DestroyInstance => "destroy instance",
            Self::CreateVolume => "create volume",
            Self::DescribeVolume => "describe volume",
            Self::AttachVolume => "attach volume",
            Self::DetachVolume => "detach volume",
            Self::DeleteVolume => "delete volume",
            Self::CreateSnapshot => "create snapshot",
            Self::DescribeSnapshot => "describe snapshot",
            Self::PublishSnapshot => "publish snapshot",
            Self::RegisterImage => "register image",
            Self::ImageInstance => "image instance",
            Self::PublishImage => "publish image",
        };
        formatter.write_str(label)
    }
}

/// Errors returned by [`MemoryBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MemoryBackendError {
    /// A failure injected with [`MemoryBackend::fail_on`].
    #[error("{0} failed: injected failure")]
    Injected(MemoryOperation),
    /// The resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Resource identifier.
        id: String,
    },
    /// The volume is attached and cannot be deleted.
    #[error("volume {0} is in use")]
    InUse(String),
}

#[derive(Debug)]
struct MemoryVolume {
    handle: VolumeHandle,
    script: VecDeque<VolumeState>,
}

#[derive(Debug)]
struct MemorySnapshot {
    handle: SnapshotHandle,
    script: VecDeque<(SnapshotStatus, u8)>,
}

#[derive(Debug)]
struct MemoryState {
    next_id: u32,
    volumes: BTreeMap<String, MemoryVolume>,
    snapshots: BTreeMap<String, MemorySnapshot>,
    images: BTreeMap<String, ImageHandle>,
    public_images: BTreeSet<String>,
    public_snapshots: BTreeSet<String>,
    shares_snapshots: bool,
    instances: BTreeMap<String, InstanceHandle>,
    destroyed: Vec<String>,
    failures: BTreeSet<MemoryOperation>,
    calls: BTreeMap<MemoryOperation, u32>,
    create_script: Vec<VolumeState>,
    attach_script: Vec<VolumeState>,
    detach_script: Vec<VolumeState>,
    snapshot_script: Vec<(SnapshotStatus, u8)>,
    created_size_override: Option<u64>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            next_id: 0,
            volumes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            images: BTreeMap::new(),
            public_images: BTreeSet::new(),
            public_snapshots: BTreeSet::new(),
            shares_snapshots: false,
            instances: BTreeMap::new(),
            destroyed: Vec::new(),
            failures: BTreeSet::new(),
            calls: BTreeMap::new(),
            create_script: vec![VolumeState::Creating, VolumeState::Available],
            attach_script: vec![VolumeState::Attaching, VolumeState::InUse],
            detach_script: vec![VolumeState::Detaching, VolumeState::Available],
            snapshot_script: vec![
                (SnapshotStatus::Pending, 0),
                (SnapshotStatus::Pending, 50),
                (SnapshotStatus::Completed, 100),
            ],
            created_size_override: None,
        }
    }
}

impl MemoryState {
    fn record(&mut self, operation: MemoryOperation) -> Result<(), MemoryBackendError> {
        *self.calls.entry(operation).or_default() += 1;
        if self.failures.contains(&operation) {
            return Err(MemoryBackendError::Injected(operation));
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn volume_mut(&mut self, volume_id: &str) -> Result<&mut MemoryVolume, MemoryBackendError> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| MemoryBackendError::NotFound {
                kind: "volume",
                id: volume_id.to_owned(),
            })
    }
}

/// In-memory provider whose resources move through scripted states.
///
/// Each describe call consumes the next scripted state; once the script runs
/// out the last state sticks. Defaults: volumes go `creating -> available`
/// after create, `attaching -> in-use` after attach, `detaching -> available`
/// after detach; snapshots report 0%, 50%, then complete. Snapshots cannot
/// be made public until [`MemoryBackend::share_snapshots`] is called.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    state: Arc<StdMutex<MemoryState>>,
}

/// Address reported for every memory instance.
pub const MEMORY_INSTANCE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

impl MemoryBackend {
    /// Creates an empty backend with the default scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call to `operation` fail.
    pub fn fail_on(&self, operation: MemoryOperation) {
        self.lock().failures.insert(operation);
    }

    /// States reported after a volume is created.
    pub fn set_create_script(&self, states: Vec<VolumeState>) {
        self.lock().create_script = states;
    }

    /// States reported after a volume is attached.
    pub fn set_attach_script(&self, states: Vec<VolumeState>) {
        self.lock().attach_script = states;
    }

    /// States reported after a volume is detached.
    pub fn set_detach_script(&self, states: Vec<VolumeState>) {
        self.lock().detach_script = states;
    }

    /// Status and progress pairs reported for new snapshots.
    pub fn set_snapshot_script(&self, steps: Vec<(SnapshotStatus, u8)>) {
        self.lock().snapshot_script = steps;
    }

    /// Lets snapshots be made public.
    pub fn share_snapshots(&self) {
        self.lock().shares_snapshots = true;
    }

    /// Forces the size of created volumes, ignoring the request.
    pub fn set_created_size(&self, size_gb: Option<u64>) {
        self.lock().created_size_override = size_gb;
    }

    /// Seeds an existing volume.
    pub fn insert_volume(&self, handle: VolumeHandle) {
        self.lock().volumes.insert(
            handle.id.clone(),
            MemoryVolume {
                handle,
                script: VecDeque::new(),
            },
        );
    }

    /// Seeds an existing snapshot.
    pub fn insert_snapshot(&self, handle: SnapshotHandle) {
        self.lock().snapshots.insert(
            handle.id.clone(),
            MemorySnapshot {
                handle,
                script: VecDeque::new(),
            },
        );
    }

    /// Seeds an existing instance.
    pub fn insert_instance(&self, handle: InstanceHandle) {
        self.lock().instances.insert(handle.id.clone(), handle);
    }

    /// Current view of a volume without consuming its script.
    #[must_use]
    pub fn volume(&self, volume_id: &str) -> Option<VolumeHandle> {
        self.lock()
            .volumes
            .get(volume_id)
            .map(|volume| volume.handle.clone())
    }

    /// Identifiers of all live volumes.
    #[must_use]
    pub fn volume_ids(&self) -> Vec<String> {
        self.lock().volumes.keys().cloned().collect()
    }

    /// Current view of a snapshot without consuming its script.
    #[must_use]
    pub fn snapshot(&self, snapshot_id: &str) -> Option<SnapshotHandle> {
        self.lock()
            .snapshots
            .get(snapshot_id)
            .map(|snapshot| snapshot.handle.clone())
    }

    /// Registered image by identifier.
    #[must_use]
    pub fn image(&self, image_id: &str) -> Option<ImageHandle> {
        self.lock().images.get(image_id).cloned()
    }

    /// Returns `true` once an image has been published.
    #[must_use]
    pub fn is_public(&self, image_id: &str) -> bool {
        self.lock().public_images.contains(image_id)
    }

    /// Returns `true` once a snapshot has been published.
    #[must_use]
    pub fn is_snapshot_public(&self, snapshot_id: &str) -> bool {
        self.lock().public_snapshots.contains(snapshot_id)
    }

    /// Returns `true` while an instance exists.
    #[must_use]
    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.lock().instances.contains_key(instance_id)
    }

    /// Instances destroyed so far, in order.
    #[must_use]
    pub fn destroyed_instances(&self) -> Vec<String> {
        self.lock().destroyed.clone()
    }

    /// Number of calls made to `operation`, failed ones included.
    #[must_use]
    pub fn calls(&self, operation: MemoryOperation) -> u32 {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    fn with_state<T, F>(&self, operation: MemoryOperation, body: F) -> Result<T, MemoryBackendError>
    where
        F: FnOnce(&mut MemoryState) -> Result<T, MemoryBackendError>,
    {
        let mut state = self.lock();
        state.record(operation)?;
        body(&mut state)
    }
}

impl Backend for MemoryBackend {
    type Error = MemoryBackendError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::CreateInstance, |state| {
            let handle = InstanceHandle {
                id: state.next_id("srv"),
                zone: request.zone.clone(),
            };
            state.instances.insert(handle.id.clone(), handle.clone());
            Ok(handle)
        });
        Box::pin(future::ready(result))
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        let result = self.with_state(MemoryOperation::WaitForReady, |state| {
            if state.instances.contains_key(&handle.id) {
                Ok(InstanceNetworking {
                    public_ip: MEMORY_INSTANCE_IP,
                    ssh_port: 22,
                })
            } else {
                Err(MemoryBackendError::NotFound {
                    kind: "instance",
                    id: handle.id.clone(),
                })
            }
        });
        Box::pin(future::ready(result))
    }

    fn describe_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, Option<InstanceDescription>, Self::Error> {
        let result = self.with_state(MemoryOperation::DescribeInstance, |state| {
            Ok(state
                .instances
                .get(&handle.id)
                .map(|found| InstanceDescription {
                    handle: found.clone(),
                    state: InstanceState::Running,
                    public_ip: Some(MEMORY_INSTANCE_IP),
                }))
        });
        Box::pin(future::ready(result))
    }

    fn reboot<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(MemoryOperation::RebootInstance, |state| {
            if state.instances.contains_key(&handle.id) {
                Ok(())
            } else {
                Err(MemoryBackendError::NotFound {
                    kind: "instance",
                    id: handle.id.clone(),
                })
            }
        });
        Box::pin(future::ready(result))
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        let result = self.with_state(MemoryOperation::DestroyInstance, |state| {
            state
                .instances
                .remove(&handle.id)
                .ok_or_else(|| MemoryBackendError::NotFound {
                    kind: "instance",
                    id: handle.id.clone(),
                })?;
            state.destroyed.push(handle.id);
            Ok(())
        });
        Box::pin(future::ready(result))
    }
}

impl VolumeBackend for MemoryBackend {
    fn create_volume<'a>(
        &'a self,
        request: &'a VolumeRequest,
    ) -> BackendFuture<'a, VolumeHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::CreateVolume, |state| {
            let handle = VolumeHandle {
                id: state.next_id("vol"),
                zone: request.zone.clone(),
                size_gb: state
                    .created_size_override
                    .or(request.size_gb)
                    .unwrap_or_default(),
                state: VolumeState::Creating,
                device: None,
                instance_id: None,
            };
            let script = state.create_script.iter().cloned().collect();
            state.volumes.insert(
                handle.id.clone(),
                MemoryVolume {
                    handle: handle.clone(),
                    script,
                },
            );
            Ok(handle)
        });
        Box::pin(future::ready(result))
    }

    fn describe_volume<'a>(
        &'a self,
        _zone: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, VolumeHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::DescribeVolume, |state| {
            let volume = state.volume_mut(volume_id)?;
            if let Some(next) = volume.script.pop_front() {
                volume.handle.state = next;
            }
            Ok(volume.handle.clone())
        });
        Box::pin(future::ready(result))
    }

    fn attach_volume<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        volume_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(MemoryOperation::AttachVolume, |state| {
            let script: VecDeque<VolumeState> = state.attach_script.iter().cloned().collect();
            let volume = state.volume_mut(volume_id)?;
            volume.handle.instance_id = Some(handle.id.clone());
            volume.handle.device = Some(device.to_owned());
            volume.script = script;
            Ok(())
        });
        Box::pin(future::ready(result))
    }

    fn detach_volume<'a>(
        &'a self,
        _handle: &'a InstanceHandle,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(MemoryOperation::DetachVolume, |state| {
            let script: VecDeque<VolumeState> = state.detach_script.iter().cloned().collect();
            let volume = state.volume_mut(volume_id)?;
            volume.handle.instance_id = None;
            volume.handle.device = None;
            volume.script = script;
            Ok(())
        });
        Box::pin(future::ready(result))
    }

    fn delete_volume<'a>(
        &'a self,
        _zone: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(MemoryOperation::DeleteVolume, |state| {
            let volume = state.volume_mut(volume_id)?;
            if volume.handle.state.is_attached() {
                return Err(MemoryBackendError::InUse(volume_id.to_owned()));
            }
            state.volumes.remove(volume_id);
            Ok(())
        });
        Box::pin(future::ready(result))
    }
}

impl SnapshotBackend for MemoryBackend {
    fn create_snapshot<'a>(
        &'a self,
        _zone: &'a str,
        volume_id: &'a str,
        description: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::CreateSnapshot, |state| {
            let source = state.volume_mut(volume_id)?.handle.clone();
            let handle = SnapshotHandle {
                id: state.next_id("snap"),
                zone: source.zone,
                volume_id: source.id,
                status: SnapshotStatus::Pending,
                progress: 0,
                description: description.to_owned(),
                size_gb: source.size_gb,
            };
            let script = state.snapshot_script.iter().cloned().collect();
            state.snapshots.insert(
                handle.id.clone(),
                MemorySnapshot {
                    handle: handle.clone(),
                    script,
                },
            );
            Ok(handle)
        });
        Box::pin(future::ready(result))
    }

    fn describe_snapshot<'a>(
        &'a self,
        _zone: &'a str,
        snapshot_id: &'a str,
    ) -> BackendFuture<'a, SnapshotHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::DescribeSnapshot, |state| {
            let snapshot =
                state
                    .snapshots
                    .get_mut(snapshot_id)
                    .ok_or_else(|| MemoryBackendError::NotFound {
                        kind: "snapshot",
                        id: snapshot_id.to_owned(),
                    })?;
            if let Some((status, progress)) = snapshot.script.pop_front() {
                snapshot.handle.status = status;
                snapshot.handle.progress = progress;
            }
            Ok(snapshot.handle.clone())
        });
        Box::pin(future::ready(result))
    }

    fn supports_public_snapshots(&self) -> bool {
        self.lock().shares_snapshots
    }

    fn publish_snapshot<'a>(
        &'a self,
        snapshot: &'a SnapshotHandle,
    ) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(MemoryOperation::PublishSnapshot, |state| {
            if !state.snapshots.contains_key(&snapshot.id) {
                return Err(MemoryBackendError::NotFound {
                    kind: "snapshot",
                    id: snapshot.id.clone(),
                });
            }
            state.public_snapshots.insert(snapshot.id.clone());
            Ok(())
        });
        Box::pin(future::ready(result))
    }
}

impl ImageBackend for MemoryBackend {
    fn register_image<'a>(
        &'a self,
        request: &'a ImageRequest,
    ) -> BackendFuture<'a, ImageHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::RegisterImage, |state| {
            let image = ImageHandle {
                id: state.next_id("img"),
                name: request.name.clone(),
                description: request.description.clone(),
                architecture: request.architecture.clone(),
                root_device: request.root_device.clone(),
                block_map: request.block_map.clone(),
                zone: request.zone.clone(),
            };
            state.images.insert(image.id.clone(), image.clone());
            Ok(image)
        });
        Box::pin(future::ready(result))
    }

    fn image_instance<'a>(
        &'a self,
        request: &'a InstanceImageRequest,
    ) -> BackendFuture<'a, ImageHandle, Self::Error> {
        let result = self.with_state(MemoryOperation::ImageInstance, |state| {
            if !state.instances.contains_key(&request.instance.id) {
                return Err(MemoryBackendError::NotFound {
                    kind: "instance",
                    id: request.instance.id.clone(),
                });
            }
            let image = ImageHandle {
                id: state.next_id("img"),
                name: request.name.clone(),
                description: request.description.clone(),
                architecture: request.architecture.clone(),
                root_device: request.root_device.clone(),
                block_map: BlockDeviceMapping::default(),
                zone: request.instance.zone.clone(),
            };
            state.images.insert(image.id.clone(), image.clone());
            Ok(image)
        });
        Box::pin(future::ready(result))
    }

    fn publish_image<'a>(&'a self, image: &'a ImageHandle) -> BackendFuture<'a, (), Self::Error> {
        let result = self.with_state(MemoryOperation::PublishImage, |state| {
            if !state.images.contains_key(&image.id) {
                return Err(MemoryBackendError::NotFound {
                    kind: "image",
                    id: image.id.clone(),
                });
            }
            state.public_images.insert(image.id.clone());
            Ok(())
        });
        Box::pin(future::ready(result))
    }
}
