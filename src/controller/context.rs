//! Shared context for cluster operations.
//!
//! The context bundles every external seam an operation needs: the metadata
//! store, the live topology view, server-side mutations, the interactive
//! prompter, and user-facing output. Tests substitute in-memory fakes for
//! all of them.

use std::sync::Arc;
use std::time::Duration;

use crate::client::probe::Topology;
use crate::client::server_ops::ServerOps;
use crate::controller::prompter::Prompter;
use crate::metadata::Metadata;

/// Default bound on waiting for a provisioned instance to catch up.
pub const DEFAULT_GTID_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default bound on waiting for a server restart after clone provisioning.
pub const DEFAULT_RESTART_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// User-facing progress and advisory output.
///
/// Warnings carry operational advice and are part of the operation's
/// observable behavior, so they go through a seam rather than straight to
/// a log macro.
pub trait Console: Send + Sync {
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
}

/// Console that forwards to structured logging.
pub struct TracingConsole;

impl Console for TracingConsole {
    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

/// Shared context for cluster operations
pub struct ClusterContext {
    /// Persistent metadata access
    pub metadata: Box<dyn Metadata>,
    /// Read-only live topology view
    pub topology: Arc<dyn Topology>,
    /// Server-side mutations
    pub server_ops: Arc<dyn ServerOps>,
    /// Interactive decision points
    pub prompter: Arc<dyn Prompter>,
    /// Progress and advisory output
    pub console: Arc<dyn Console>,
    /// Whether an operator is attending the session
    pub interactive: bool,
    /// Bound on transaction catch-up waits
    pub gtid_wait_timeout: Duration,
    /// Bound on restart waits after clone provisioning
    pub restart_wait_timeout: Duration,
}

impl ClusterContext {
    pub fn new(
        metadata: Box<dyn Metadata>,
        topology: Arc<dyn Topology>,
        server_ops: Arc<dyn ServerOps>,
        prompter: Arc<dyn Prompter>,
        console: Arc<dyn Console>,
    ) -> Self {
        Self {
            metadata,
            topology,
            server_ops,
            prompter,
            console,
            interactive: false,
            gtid_wait_timeout: DEFAULT_GTID_WAIT_TIMEOUT,
            restart_wait_timeout: DEFAULT_RESTART_WAIT_TIMEOUT,
        }
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}
