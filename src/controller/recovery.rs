//! Recovery method arbitration.
//!
//! Given how a joining instance's transaction history compares with the
//! donor's, decide whether to provision it by clone, by incremental
//! distributed recovery, or not at all. The decision table is driven purely
//! by data (GTID comparison, capabilities, flags); interactive choices go
//! through the [`Prompter`] seam so the arbiter never touches console I/O.

use thiserror::Error;
use tracing::debug;

use crate::client::types::GtidComparison;
use crate::controller::capabilities::InstanceCapabilities;
use crate::controller::error::Error;
use crate::controller::prompter::{Confirmation, Prompter};

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryRequest {
    /// Let the arbiter decide, prompting where ambiguous.
    #[default]
    Auto,
    /// Provision by physical clone, discarding the target's current data.
    Clone,
    /// Provision by replaying missing transactions over the channel.
    Incremental,
}

#[derive(Debug, Error)]
#[error("Invalid recoveryMethod '{0}': must be one of 'auto', 'clone', 'incremental'")]
pub struct InvalidRecoveryRequest(String);

impl std::str::FromStr for RecoveryRequest {
    type Err = InvalidRecoveryRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RecoveryRequest::Auto),
            "clone" => Ok(RecoveryRequest::Clone),
            "incremental" => Ok(RecoveryRequest::Incremental),
            _ => Err(InvalidRecoveryRequest(s.to_string())),
        }
    }
}

/// What the arbiter settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMethod {
    Clone,
    Incremental,
}

/// A chosen method plus advisory notes the caller surfaces verbatim.
#[derive(Debug)]
pub struct RecoveryDecision {
    pub method: RecoveryMethod,
    pub notes: Vec<String>,
}

impl RecoveryDecision {
    fn plain(method: RecoveryMethod) -> Self {
        Self {
            method,
            notes: Vec::new(),
        }
    }

    fn with_note(method: RecoveryMethod, note: impl Into<String>) -> Self {
        Self {
            method,
            notes: vec![note.into()],
        }
    }
}

/// Everything the decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterInput {
    pub requested: RecoveryRequest,
    pub comparison: GtidComparison,
    pub capabilities: InstanceCapabilities,
    /// The cluster was declared to hold its complete transaction history,
    /// so an empty target can be trusted to be genuinely new.
    pub gtid_set_is_complete: bool,
    pub interactive: bool,
}

/// Decide the provisioning method for a joining or rejoining instance.
pub async fn decide(
    input: ArbiterInput,
    prompter: &dyn Prompter,
) -> Result<RecoveryDecision, Error> {
    debug!(?input.requested, ?input.comparison, "Arbitrating recovery method");

    match input.requested {
        RecoveryRequest::Incremental => decide_incremental(&input),
        RecoveryRequest::Clone => decide_clone(&input),
        RecoveryRequest::Auto => decide_auto(&input, prompter).await,
    }
}

fn decide_incremental(input: &ArbiterInput) -> Result<RecoveryDecision, Error> {
    if !input.comparison.incremental_safe() {
        return Err(Error::GtidIncompatible(format!(
            "Cannot use recoveryMethod=incremental: {}",
            incompatibility_reason(input.comparison)
        )));
    }
    Ok(RecoveryDecision::plain(RecoveryMethod::Incremental))
}

fn decide_clone(input: &ArbiterInput) -> Result<RecoveryDecision, Error> {
    if !input.capabilities.supports_clone {
        return Err(Error::Argument(
            "Option 'recoveryMethod=clone' not supported on target server version: \
             server does not support the MySQL Clone plugin"
                .to_string(),
        ));
    }
    // Explicit clone overrides any GTID state.
    Ok(RecoveryDecision::plain(RecoveryMethod::Clone))
}

async fn decide_auto(
    input: &ArbiterInput,
    prompter: &dyn Prompter,
) -> Result<RecoveryDecision, Error> {
    match input.comparison {
        GtidComparison::Identical | GtidComparison::Subset => {
            // Nothing to discard and nothing purged: incremental is safe.
            Ok(RecoveryDecision::plain(RecoveryMethod::Incremental))
        }

        GtidComparison::Empty => decide_auto_empty(input, prompter).await,

        GtidComparison::Purged => {
            if !input.capabilities.supports_clone {
                return Err(Error::GtidIncompatible(
                    "The instance is missing transactions that were purged from all \
                     cluster members and the target does not support clone recovery"
                        .to_string(),
                ));
            }
            Ok(RecoveryDecision::with_note(
                RecoveryMethod::Clone,
                "Clone based recovery selected: the instance is missing purged \
                 transactions, but its state seems to be safely recoverable by clone",
            ))
        }

        GtidComparison::Errant | GtidComparison::ErrantAndPurged => {
            if !input.capabilities.supports_clone {
                return Err(Error::GtidIncompatible(format!(
                    "{} and the target does not support clone recovery",
                    incompatibility_reason(input.comparison)
                )));
            }
            if !input.interactive {
                return Err(Error::GtidIncompatible(format!(
                    "{}. Discarding the instance data with recoveryMethod=clone is \
                     the only way to add it to the cluster",
                    incompatibility_reason(input.comparison)
                )));
            }
            match prompter
                .confirm(
                    "The instance contains transactions that do not originate from the \
                     cluster. Clone recovery will discard that data. Continue with clone?",
                    false,
                )
                .await
            {
                Confirmation::Yes => Ok(RecoveryDecision::plain(RecoveryMethod::Clone)),
                Confirmation::No => Err(Error::Cancelled("Cancelled".to_string())),
            }
        }
    }
}

async fn decide_auto_empty(
    input: &ArbiterInput,
    prompter: &dyn Prompter,
) -> Result<RecoveryDecision, Error> {
    if input.gtid_set_is_complete {
        return Ok(RecoveryDecision::with_note(
            RecoveryMethod::Incremental,
            "Incremental state recovery selected because the cluster was created \
             with gtidSetIsComplete=true",
        ));
    }

    if !input.capabilities.supports_clone {
        if !input.interactive {
            return Err(Error::Argument(
                "The target instance has an empty GTID set. Please select a recovery \
                 method with the recoveryMethod option"
                    .to_string(),
            ));
        }
        return match prompter
            .confirm(
                "The safety of incremental recovery cannot be determined for an empty \
                 instance. Continue with incremental recovery?",
                false,
            )
            .await
        {
            Confirmation::Yes => Ok(RecoveryDecision::plain(RecoveryMethod::Incremental)),
            Confirmation::No => Err(Error::Cancelled("Cancelled".to_string())),
        };
    }

    if !input.interactive {
        return Err(Error::Argument(
            "The target instance has an empty GTID set. Please select a recovery \
             method with the recoveryMethod option (clone or incremental)"
                .to_string(),
        ));
    }

    match prompter
        .choose(
            "The target instance has an empty GTID set. Please select a recovery method",
            &["Clone", "Incremental recovery", "Abort"],
        )
        .await
    {
        Some(0) => Ok(RecoveryDecision::plain(RecoveryMethod::Clone)),
        Some(1) => Ok(RecoveryDecision::plain(RecoveryMethod::Incremental)),
        _ => Err(Error::Cancelled("Cancelled".to_string())),
    }
}

fn incompatibility_reason(comparison: GtidComparison) -> &'static str {
    match comparison {
        GtidComparison::Errant => {
            "the instance contains errant transactions that did not originate \
             from the cluster"
        }
        GtidComparison::Purged => {
            "the instance is missing transactions that were purged from all \
             cluster members"
        }
        GtidComparison::ErrantAndPurged => {
            "the instance contains errant transactions and is also missing \
             transactions that were purged from all cluster members"
        }
        _ => "the instance state is not compatible with incremental recovery",
    }
}
