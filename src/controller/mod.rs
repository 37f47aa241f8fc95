//! Cluster orchestration.
//!
//! Everything above the client layer: the membership operation engine, the
//! recovery method arbiter, the rescan reconciler, replication option
//! reconciliation and router bookkeeping, all sharing one
//! [`context::ClusterContext`].

pub mod address;
pub mod capabilities;
pub mod context;
pub mod error;
pub mod membership;
pub mod prompter;
pub mod recovery;
pub mod repl_options;
pub mod rescan;
pub mod router;

pub use context::{ClusterContext, Console, TracingConsole};
pub use error::{Error, Result};
pub use membership::{
    AddInstanceOptions, Cluster, ClusterStatus, CreateClusterOptions, RemoveInstanceOptions,
};
pub use prompter::{Confirmation, NonInteractive, Prompter};
pub use recovery::{RecoveryMethod, RecoveryRequest};
pub use rescan::RescanOptions;
pub use router::RouterInfo;
