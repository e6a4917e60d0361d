//! Binary entry point for the `rebundle` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use rebundle::{
    AssumeYes, CleanupOptions, Confirm, ImageOptions, LifecycleConfig, LifecycleError,
    ProcessCommandRunner, RemoteConfig, RemoteExecutor, ScalewayBackend, ScalewayBackendError,
    ScalewayConfig, SnapshotOptions, TerminalConfirm, VolumeLifecycle, Workflow,
    WorkflowSettings,
};

mod cli;

use cli::{Cli, Command};

const EXIT_FAILURE: i32 = 1;
const EXIT_ABORTED: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend error: {0}")]
    Backend(#[from] ScalewayBackendError),
    #[error("ssh configuration error: {0}")]
    Remote(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError<ScalewayBackendError>),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Lifecycle(err) if err.is_operator_abort() => EXIT_ABORTED,
            _ => EXIT_FAILURE,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let confirm: &dyn Confirm = if cli.yes { &AssumeYes } else { &TerminalConfirm };
    let mut workflow = build_workflow(confirm)?;
    let mut stdout = io::stdout();

    match cli.command {
        Command::Setup => {
            let outcome = workflow.setup().await?;
            let record = &outcome.record;
            writeln!(
                stdout,
                "volume {} mounted at {} on {}",
                record.volume_id, record.mount_path, record.networking.public_ip
            )
            .ok();
        }
        Command::Cleanup(args) => {
            let options = CleanupOptions {
                image_name: args.image_name,
            };
            let outcome = workflow.cleanup(&options).await?;
            writeln!(stdout, "snapshot {}", outcome.snapshot.id).ok();
            if let Some(image) = outcome.image {
                writeln!(stdout, "image {}", image.image.id).ok();
            }
        }
        Command::Snapshot(args) => {
            let options = SnapshotOptions {
                description: args.description,
                reattach: args.reattach,
            };
            let outcome = workflow.snapshot_volume(&args.volume_id, &options).await?;
            writeln!(stdout, "snapshot {}", outcome.snapshot.id).ok();
            if let Some(replacement) = outcome.replacement {
                writeln!(
                    stdout,
                    "volume {} attached as {}",
                    replacement.volume.id, replacement.device
                )
                .ok();
            }
        }
        Command::Register(args) => {
            let outcome = workflow
                .register(&args.snapshot_id, &args.name, args.description.as_deref())
                .await?;
            writeln!(stdout, "image {}", outcome.image.id).ok();
        }
        Command::Image(args) => {
            let options = ImageOptions {
                instance_id: args.instance_id,
                name: args.name,
                description: args.description,
                force_reboot: args.force_reboot,
            };
            let outcome = workflow.image_instance(&options).await?;
            writeln!(stdout, "image {}", outcome.image.id).ok();
        }
    }
    Ok(())
}

type CliWorkflow<'a> = Workflow<ScalewayBackend, ProcessCommandRunner, &'a dyn Confirm>;

fn build_workflow(confirm: &dyn Confirm) -> Result<CliWorkflow<'_>, CliError> {
    let scaleway_config =
        ScalewayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let lifecycle_config =
        LifecycleConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    lifecycle_config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let remote_config =
        RemoteConfig::load_without_cli_args().map_err(|err| CliError::Remote(err.to_string()))?;

    let backend = ScalewayBackend::new(scaleway_config)?;
    let instance = backend.default_request()?;
    let remote = RemoteExecutor::with_process_runner(remote_config)
        .map_err(|err| CliError::Remote(err.to_string()))?;
    let lifecycle = VolumeLifecycle::new(backend, remote, lifecycle_config.policy());
    let settings = WorkflowSettings {
        instance,
        lifecycle: lifecycle_config,
    };
    Ok(Workflow::new(lifecycle, settings, confirm))
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
