//! SQL sessions, live-topology probing and the parsed state model.

pub mod mysql_session;
pub mod parsing;
pub mod probe;
pub mod server_ops;
pub mod session;
pub mod types;

pub use probe::{ProbeError, Topology, TopologyProber};
pub use server_ops::{ServerOps, SqlServerOps};
pub use session::{SessionError, SessionFactory, SqlRow, SqlSession, SqlValue};
pub use types::{
    GtidComparison, GtidSet, InstanceAddress, InstanceSnapshot, MemberState,
    ReplicationChannelStatus, ServerVersion,
};
