//! Interactive decision points.
//!
//! Operations that can destroy data or pick between recovery strategies ask
//! through [`Prompter`] instead of deciding silently. Non-interactive runs
//! use [`NonInteractive`], which declines everything so callers fail closed.

use async_trait::async_trait;

/// Answers to a yes/no confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Yes,
    No,
}

/// Asks the operator questions during an operation.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask a yes/no question. `default_yes` controls what an empty answer
    /// means when a terminal is attached.
    async fn confirm(&self, question: &str, default_yes: bool) -> Confirmation;

    /// Ask the operator to pick one of `choices`. Returns the chosen index,
    /// or `None` to abort.
    async fn choose(&self, question: &str, choices: &[&str]) -> Option<usize>;
}

/// Prompter for unattended runs. Every confirmation is declined and every
/// choice aborted, so anything that would need a human fails instead of
/// guessing.
pub struct NonInteractive;

#[async_trait]
impl Prompter for NonInteractive {
    async fn confirm(&self, _question: &str, _default_yes: bool) -> Confirmation {
        Confirmation::No
    }

    async fn choose(&self, _question: &str, _choices: &[&str]) -> Option<usize> {
        None
    }
}
