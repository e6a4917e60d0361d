//! Bounded polling of provider state.
//!
//! [`poll_until`] drives a status fetch until a classifier reports the target
//! was reached, the provider reported a terminal failure, or the attempt
//! budget ran out. It never issues more than `max_attempts` fetches and never
//! sleeps after the final one.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// Attempt budget and fixed delay between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Maximum number of status fetches.
    pub max_attempts: u32,
    /// Delay between consecutive fetches.
    pub delay: Duration,
}

impl PollPolicy {
    /// Creates a policy with the given budget and delay.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Upper bound on the time spent sleeping under this policy.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.delay.saturating_mul(self.max_attempts)
    }
}

/// Outcome of classifying one observed status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The target state was observed.
    Reached,
    /// Keep polling.
    Pending,
    /// The provider reported a state the target can no longer be reached from.
    Failed,
}

/// Classifies `status` against a target set and a terminal-failure set.
#[must_use]
pub fn classify_membership<S: PartialEq>(status: &S, targets: &[S], terminal: &[S]) -> Verdict {
    if targets.contains(status) {
        Verdict::Reached
    } else if terminal.contains(status) {
        Verdict::Failed
    } else {
        Verdict::Pending
    }
}

/// Errors raised by [`poll_until`].
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt was used without reaching the target.
    #[error("gave up after {attempts} attempts (last status: {})", last.as_deref().unwrap_or("none"))]
    Exhausted {
        /// Number of fetches performed.
        attempts: u32,
        /// Last observed status, if any fetch succeeded.
        last: Option<String>,
    },
    /// A status fetch failed.
    #[error("status fetch failed on attempt {attempt}: {source}")]
    Fetch {
        /// Attempt index (1-based) that failed.
        attempt: u32,
        /// Underlying provider error.
        #[source]
        source: E,
    },
    /// A terminal failure state was observed.
    #[error("terminal status {observed} after {attempts} attempts")]
    Failed {
        /// Number of fetches performed.
        attempts: u32,
        /// Observed terminal status.
        observed: String,
    },
}

impl<E> PollError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of fetches issued before the error.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
            Self::Fetch { attempt, .. } => *attempt,
        }
    }
}

/// Polls `fetch` until `classify` reports [`Verdict::Reached`].
///
/// `label` names the wait in log output, for example `"attach vol-1"`.
///
/// # Errors
///
/// Returns [`PollError::Fetch`] as soon as a fetch fails,
/// [`PollError::Failed`] when a terminal status is observed, and
/// [`PollError::Exhausted`] once `max_attempts` fetches have been issued.
pub async fn poll_until<S, E, F, Fut, C>(
    label: &str,
    policy: PollPolicy,
    mut fetch: F,
    mut classify: C,
) -> Result<S, PollError<E>>
where
    S: fmt::Display,
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    C: FnMut(&S) -> Verdict,
{
    let started = Instant::now();
    let mut last: Option<String> = None;

    for attempt in 1..=policy.max_attempts {
        let status = fetch()
            .await
            .map_err(|source| PollError::Fetch { attempt, source })?;
        let elapsed = started.elapsed();
        let verdict = classify(&status);
        debug!(
            wait = label,
            attempt,
            max_attempts = policy.max_attempts,
            elapsed_ms = elapsed.as_millis(),
            status = %status,
            ?verdict,
            "polled status"
        );

        match verdict {
            Verdict::Reached => {
                info!(
                    wait = label,
                    attempt,
                    elapsed_secs = elapsed.as_secs(),
                    status = %status,
                    "target state reached"
                );
                return Ok(status);
            }
            Verdict::Failed => {
                return Err(PollError::Failed {
                    attempts: attempt,
                    observed: status.to_string(),
                });
            }
            Verdict::Pending => last = Some(status.to_string()),
        }

        if attempt < policy.max_attempts {
            sleep(policy.delay).await;
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}
