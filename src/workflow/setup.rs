//! `rebundle setup`: provision, attach, prepare, and record.

use camino::Utf8Path;
use tracing::info;
use uuid::Uuid;

use crate::backend::{InstanceHandle, InstanceNetworking, InstanceState};
use crate::confirm::Confirm;
use crate::handoff::HandoffRecord;
use crate::image::ImageBackend;
use crate::lifecycle::LifecycleError;
use crate::remote::{
    CommandRunner, change_owner, first_directory_entry, make_directory, make_filesystem, mount,
};
use crate::volume::VolumeRequest;

use super::Workflow;
use super::rollback::Created;

/// Result of a successful setup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetupOutcome {
    /// What was written to the handoff file.
    pub record: HandoffRecord,
    /// Whether a local directory was copied onto the volume.
    pub uploaded: bool,
}

impl<B, R, C> Workflow<B, R, C>
where
    B: ImageBackend,
    R: CommandRunner,
    C: Confirm,
{
    /// Provisions an instance (or reuses the configured one), creates and
    /// attaches a volume, prepares and mounts its filesystem, optionally
    /// copies the configured source directory onto it, and writes the
    /// handoff file.
    ///
    /// On failure, the volume and instance created by this run are released
    /// and the outcome is appended to the error.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Precondition`] when a previous setup was not
    /// cleaned up, the source directory is missing, the configured instance
    /// is unusable, or the mount point is not empty. Provider, polling,
    /// device, and remote failures surface with their own kinds.
    pub async fn setup(&mut self) -> Result<SetupOutcome, LifecycleError<B::Error>> {
        let store = self.handoff_store();
        if store.exists()? {
            return Err(LifecycleError::Precondition(format!(
                "handoff file {} already exists; run `rebundle cleanup` first",
                store.path()
            )));
        }
        if let Some(source) = &self.settings.lifecycle.source_dir
            && !Utf8Path::new(source).is_dir()
        {
            return Err(LifecycleError::Precondition(format!(
                "source directory {source} does not exist"
            )));
        }

        let mut created = Created::default();
        match self.setup_steps(&mut created).await {
            Ok(outcome) => {
                store.write(&outcome.record)?;
                info!(path = %store.path(), volume = %outcome.record.volume_id, "setup complete");
                Ok(outcome)
            }
            Err(err) => {
                let note = self.rollback(created).await;
                Err(err.with_cleanup_note(note))
            }
        }
    }

    async fn setup_steps(
        &mut self,
        created: &mut Created,
    ) -> Result<SetupOutcome, LifecycleError<B::Error>> {
        let (instance, networking, instance_created) = self.acquire_instance(created).await?;

        let lifecycle_config = &self.settings.lifecycle;
        let request = VolumeRequest::new(
            format!("rebundle-{}", Uuid::new_v4().simple()),
            &instance.zone,
            &self.settings.instance.project_id,
        )
        .size_gb(lifecycle_config.volume_size_gb)
        .source_snapshot(lifecycle_config.source_snapshot.clone())
        .organisation_id(self.settings.instance.organisation_id.clone());
        let device = lifecycle_config.device.clone();
        let mount_path = lifecycle_config.mount_path.clone();

        let pending = self.lifecycle.request_volume(&request).await?;
        created.volume = Some(pending.volume.clone());
        let volume = self.lifecycle.await_volume(&pending).await?;
        created.volume = Some(volume.clone());

        created.attached_to = Some(instance.clone());
        let attached = self
            .lifecycle
            .attach(&volume, &instance, &networking, &device)
            .await?;

        self.prepare_filesystem(&networking, &attached.device, &mount_path, &request)?;
        let uploaded = self.upload_source(&networking, &mount_path)?;

        Ok(SetupOutcome {
            record: HandoffRecord {
                volume_id: volume.id,
                instance,
                networking,
                device: attached.device,
                mount_path,
                instance_created,
                key_file: self.lifecycle.remote().config().ssh_identity_file.clone(),
                source_snapshot: request.source_snapshot,
            },
            uploaded,
        })
    }

    async fn acquire_instance(
        &self,
        created: &mut Created,
    ) -> Result<(InstanceHandle, InstanceNetworking, bool), LifecycleError<B::Error>> {
        let backend = self.lifecycle.backend();
        if let Some(instance_id) = &self.settings.lifecycle.instance_id {
            let handle = InstanceHandle {
                id: instance_id.clone(),
                zone: self.settings.instance.zone.clone(),
            };
            let description = backend
                .describe_instance(&handle)
                .await
                .map_err(|source| LifecycleError::Provisioning {
                    operation: "describe instance",
                    resource: instance_id.clone(),
                    source,
                })?
                .ok_or_else(|| {
                    LifecycleError::Precondition(format!(
                        "instance {instance_id} not found in zone {}",
                        handle.zone
                    ))
                })?;
            if description.state != InstanceState::Running {
                return Err(LifecycleError::Precondition(format!(
                    "instance {instance_id} is {}, not running",
                    description.state
                )));
            }
            info!(instance = %instance_id, "reusing existing instance");
            let networking = self.wait_for_instance(&handle).await?;
            return Ok((handle, networking, false));
        }

        info!(
            instance_type = %self.settings.instance.instance_type,
            zone = %self.settings.instance.zone,
            "creating instance"
        );
        let handle = backend
            .create(&self.settings.instance)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "create instance",
                resource: self.settings.instance.instance_type.clone(),
                source,
            })?;
        created.instance = Some(handle.clone());
        let networking = self.wait_for_instance(&handle).await?;
        Ok((handle, networking, true))
    }

    async fn wait_for_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<InstanceNetworking, LifecycleError<B::Error>> {
        let networking = self
            .lifecycle
            .backend()
            .wait_for_ready(handle)
            .await
            .map_err(|source| LifecycleError::Provisioning {
                operation: "wait for instance",
                resource: handle.id.clone(),
                source,
            })?;
        info!(instance = %handle.id, address = %networking.public_ip, "instance ready");
        Ok(networking)
    }

    fn prepare_filesystem(
        &self,
        networking: &InstanceNetworking,
        device: &str,
        mount_path: &str,
        request: &VolumeRequest,
    ) -> Result<(), LifecycleError<B::Error>> {
        let remote = self.lifecycle.remote();
        if request.source_snapshot.is_none() {
            info!(device, "formatting volume");
            remote.run_checked(networking, &make_filesystem(device))?;
        }

        remote.run_checked(networking, &make_directory(mount_path))?;
        let listing = remote.run_checked(networking, &first_directory_entry(mount_path))?;
        if let Some(entry) = listing.stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            return Err(LifecycleError::Precondition(format!(
                "mount point {mount_path} is not empty (found {entry})"
            )));
        }

        remote.run_checked(networking, &mount(device, mount_path))?;
        let user = &remote.config().ssh_user;
        remote.run_checked(networking, &change_owner(user, mount_path))?;
        info!(device, mount_path, "volume mounted");
        Ok(())
    }

    fn upload_source(
        &self,
        networking: &InstanceNetworking,
        mount_path: &str,
    ) -> Result<bool, LifecycleError<B::Error>> {
        let Some(source) = &self.settings.lifecycle.source_dir else {
            return Ok(false);
        };
        let prompt = format!(
            "Copy {source} to {}:{mount_path}?",
            networking.public_ip
        );
        if !self.ask(&prompt)? {
            info!(source = %source, "skipping upload");
            return Ok(false);
        }
        self.lifecycle
            .remote()
            .upload(Utf8Path::new(source), networking, mount_path)?;
        info!(source = %source, mount_path, "upload complete");
        Ok(true)
    }
}
