//! Error types for cluster operations.
//!
//! Defines custom error types with classification for retry behavior and
//! for distinguishing user mistakes from infrastructure failures.

use thiserror::Error;

use crate::client::probe::ProbeError;
use crate::client::session::SessionError;
use crate::client::types::ParseError;
use crate::metadata::MetadataError;

/// Error type for cluster operations
#[derive(Error, Debug)]
pub enum Error {
    /// The target instance could not be reached or dropped mid-operation
    #[error(transparent)]
    Connectivity(SessionError),

    /// The server rejected a statement or returned something unusable
    #[error(transparent)]
    Server(SessionError),

    /// Invalid argument supplied by the caller
    #[error("Argument error: {0}")]
    Argument(String),

    /// The metadata schema is missing, damaged, or lacks an addressed row
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Transaction histories cannot be reconciled without provisioning
    #[error("{0}")]
    GtidIncompatible(String),

    /// The operation was declined at an interactive prompt
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A bounded wait expired before the watched condition held
    #[error("Timeout waiting for {operation} after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The cluster was dissolved; the handle is no longer usable
    #[error("The cluster object is disconnected: the cluster was dissolved")]
    Dissolved,
}

impl Error {
    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity(_) | Error::Timeout { .. })
    }

    /// Check if this error reflects caller input rather than cluster state
    pub fn is_argument(&self) -> bool {
        matches!(self, Error::Argument(_))
    }

    /// Check if the operation was declined by the caller, as opposed to
    /// failing
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// The MySQL client or server error code, when one applies
    pub fn native_code(&self) -> Option<u16> {
        match self {
            Error::Connectivity(e) | Error::Server(e) => e.native_code(),
            _ => None,
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        if e.is_connectivity() {
            Error::Connectivity(e)
        } else {
            Error::Server(e)
        }
    }
}

impl From<ProbeError> for Error {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Session(s) => s.into(),
            ProbeError::Parse(p) => Error::Metadata(p.to_string()),
            ProbeError::Timeout {
                operation,
                duration,
            } => Error::Timeout {
                operation,
                seconds: duration.as_secs(),
            },
        }
    }
}

impl From<MetadataError> for Error {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::Session(s) => s.into(),
            other => Error::Metadata(other.to_string()),
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Argument(e.to_string())
    }
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
