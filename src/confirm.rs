//! Operator checkpoints before destructive or irreversible steps.
//!
//! Workflows ask a [`Confirm`] implementation before deleting volumes,
//! terminating instances, copying data, or publishing images. The terminal
//! implementation prompts on stderr; [`AssumeYes`] backs `--yes` for
//! headless runs.

use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::info;

/// Errors raised while asking for confirmation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfirmError {
    /// Raised when the prompt cannot be written or the answer read.
    #[error("failed to read confirmation: {0}")]
    Io(String),
}

/// Yes/no checkpoint strategy.
pub trait Confirm {
    /// Asks `prompt`; `default` applies to an empty answer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfirmError`] when the answer cannot be obtained.
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, ConfirmError>;
}

impl<C: Confirm + ?Sized> Confirm for &C {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, ConfirmError> {
        (**self).confirm(prompt, default)
    }
}

/// Prompts on stderr and reads the answer from stdin.
///
/// End of input counts as the default answer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, ConfirmError> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let mut stderr = io::stderr().lock();
        write!(stderr, "{prompt} {hint} ").map_err(|err| ConfirmError::Io(err.to_string()))?;
        stderr
            .flush()
            .map_err(|err| ConfirmError::Io(err.to_string()))?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|err| ConfirmError::Io(err.to_string()))?;
        Ok(parse_answer(&answer, default))
    }
}

/// Answers yes to everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool, ConfirmError> {
        info!(prompt, "assuming yes");
        Ok(true)
    }
}

/// Interprets a typed answer. Anything unrecognised falls back to `default`.
#[must_use]
pub fn parse_answer(answer: &str, default: bool) -> bool {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("y\n", false, true)]
    #[case("YES", false, true)]
    #[case("n", true, false)]
    #[case("\n", true, true)]
    #[case("", false, false)]
    #[case("maybe", false, false)]
    fn parse_answer_respects_default(
        #[case] answer: &str,
        #[case] default: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(parse_answer(answer, default), expected);
    }

    #[test]
    fn assume_yes_always_confirms() {
        assert_eq!(AssumeYes.confirm("Delete volume vol-1?", false), Ok(true));
    }
}
