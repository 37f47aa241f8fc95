//! mysql-admin library crate
//!
//! Membership and recovery orchestration engine for MySQL clusters and
//! replica sets: add/remove/rejoin instances, primary promotion, metadata
//! rescan, router bookkeeping and replication-option reconciliation.
//!
//! The engine is built from three layers:
//! - [`client`]: the SQL session seam, live-topology probing and the parsed
//!   state model (GTID sets, member states, replication channels).
//! - [`metadata`]: the persistent metadata schema accessor (instances,
//!   clusters, routers) with legacy-layout translation.
//! - [`controller`]: the operation engine itself: membership operations,
//!   the recovery-method arbiter, the rescan reconciler, the router
//!   registrar and the replication-option reconciler.
//!
//! All server I/O goes through the [`client::session::SqlSession`] trait, so
//! the whole engine can be exercised against an in-memory mock (see
//! `tests/functional/`). No operation contacts more than one instance at a
//! time; long waits are bounded polling loops whose timeouts come from
//! [`controller::context::ClusterContext`].

pub mod client;
pub mod controller;
pub mod metadata;

pub use client::session::{SessionError, SessionFactory, SqlRow, SqlSession, SqlValue};
pub use client::types::{GtidComparison, GtidSet, InstanceAddress, MemberState};
pub use controller::context::ClusterContext;
pub use controller::error::{Error, Result};
pub use controller::membership::Cluster;
