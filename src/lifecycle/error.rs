//! Error type for the volume lifecycle and the workflows built on it.

use thiserror::Error;

use crate::confirm::ConfirmError;
use crate::device::DeviceError;
use crate::handoff::HandoffError;
use crate::remote::RemoteError;
use crate::wait::PollError;

use super::state::TransitionError;

/// Errors raised while driving volumes, snapshots, and images.
#[derive(Debug, Error)]
pub enum LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    /// The provider rejected a request.
    #[error("{operation} failed for {resource}: {source}")]
    Provisioning {
        /// Operation attempted (for example `attach volume`).
        operation: &'static str,
        /// Resource concerned.
        resource: String,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The target state was not reached within the attempt budget.
    #[error(
        "timed out waiting for {operation} on {resource} after {attempts} attempts (last status: {})",
        last_status.as_deref().unwrap_or("none")
    )]
    Timeout {
        /// Operation being waited on.
        operation: &'static str,
        /// Resource concerned.
        resource: String,
        /// Fetches performed.
        attempts: u32,
        /// Last status observed.
        last_status: Option<String>,
    },
    /// A status check failed while waiting.
    #[error("status check for {operation} on {resource} failed on attempt {attempt}: {source}")]
    PollFetch {
        /// Operation being waited on.
        operation: &'static str,
        /// Resource concerned.
        resource: String,
        /// Attempt index (1-based) that failed.
        attempt: u32,
        /// Provider error.
        #[source]
        source: E,
    },
    /// The provider reported a terminal failure state while waiting.
    #[error("{operation} on {resource} ended in status {status}")]
    Rejected {
        /// Operation being waited on.
        operation: &'static str,
        /// Resource concerned.
        resource: String,
        /// Terminal status observed.
        status: String,
    },
    /// A requirement was not met before any provider call.
    #[error("{0}")]
    Precondition(String),
    /// A volume was asked to skip or repeat a phase.
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// The operator declined a checkpoint.
    #[error("aborted by operator before {action}")]
    OperatorAborted {
        /// Declined action.
        action: String,
    },
    /// The operator could not be asked.
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
    /// Image registration was refused before reaching the provider.
    #[error("image registration rejected: {0}")]
    Registration(String),
    /// The attached device could not be identified.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A command on the instance failed.
    #[error("remote command failed: {0}")]
    Remote(#[from] RemoteError),
    /// The handoff file could not be used.
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    /// An error followed by the outcome of the cleanup it triggered.
    #[error("{error} ({note})")]
    WithCleanup {
        /// Original failure.
        #[source]
        error: Box<Self>,
        /// What cleanup did or failed to do.
        note: String,
    },
}

impl<E> LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    /// Maps a polling failure onto the lifecycle error kinds.
    pub(crate) fn from_poll(operation: &'static str, resource: &str, err: PollError<E>) -> Self {
        match err {
            PollError::Exhausted { attempts, last } => Self::Timeout {
                operation,
                resource: resource.to_owned(),
                attempts,
                last_status: last,
            },
            PollError::Fetch { attempt, source } => Self::PollFetch {
                operation,
                resource: resource.to_owned(),
                attempt,
                source,
            },
            PollError::Failed { observed, .. } => Self::Rejected {
                operation,
                resource: resource.to_owned(),
                status: observed,
            },
        }
    }

    /// Attaches a cleanup note to this error. Empty notes are dropped.
    #[must_use]
    pub fn with_cleanup_note(self, note: String) -> Self {
        if note.is_empty() {
            return self;
        }
        Self::WithCleanup {
            error: Box::new(self),
            note,
        }
    }

    /// Returns `true` when the run stopped because the operator said no.
    #[must_use]
    pub fn is_operator_abort(&self) -> bool {
        match self {
            Self::OperatorAborted { .. } => true,
            Self::WithCleanup { error, .. } => error.is_operator_abort(),
            _ => false,
        }
    }
}
