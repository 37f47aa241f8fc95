//! Live topology probing.
//!
//! The [`Topology`] trait is the read-only view of the running servers:
//! given an address, produce an [`InstanceSnapshot`]. The real
//! implementation, [`TopologyProber`], issues SELECTs over a
//! [`SessionFactory`]; tests substitute a scripted implementation.
//!
//! Probing never mutates server state. Transient connection failures are
//! retried a bounded number of times; the last native error is surfaced
//! verbatim for diagnostics.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::client::parsing::{parse_channel_row, parse_member_state};
use crate::client::session::{SessionError, SessionFactory, SqlSession};
use crate::client::types::{
    GtidSet, InstanceAddress, InstanceSnapshot, MemberState, ParseError, ServerVersion,
};

/// Errors raised while probing or waiting on live topology state.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Timed out after {duration:?} waiting for {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl ProbeError {
    /// Whether the underlying cause is a connectivity failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ProbeError::Session(e) if e.is_connectivity())
    }
}

/// Role of a member within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Primary,
    Secondary,
}

/// One row of the group's membership view, as reported by a member.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub server_uuid: String,
    pub address: InstanceAddress,
    pub state: MemberState,
    pub role: MemberRole,
}

/// Read-only view of the live topology.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Probe one instance. Unreachable instances surface as a connectivity
    /// [`ProbeError`], distinguishable from server-side errors.
    async fn probe(&self, address: &InstanceAddress) -> Result<InstanceSnapshot, ProbeError>;

    /// The group membership as the instance at `via` sees it.
    async fn members(&self, via: &InstanceAddress) -> Result<Vec<GroupMember>, ProbeError>;
}

/// Default interval between polls in wait loops.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Connection attempts before a probe gives up.
const PROBE_CONNECT_ATTEMPTS: u32 = 3;
/// Backoff between connection attempts.
const PROBE_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// The real prober, reading system variables and `performance_schema`
/// replication views over a classic session.
pub struct TopologyProber<F: SessionFactory> {
    factory: F,
}

impl<F: SessionFactory> TopologyProber<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    async fn connect_with_retry(
        &self,
        address: &InstanceAddress,
    ) -> Result<Box<dyn SqlSession>, SessionError> {
        let mut last_err = None;
        for attempt in 1..=PROBE_CONNECT_ATTEMPTS {
            match self.factory.connect(address).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_connectivity() && attempt < PROBE_CONNECT_ATTEMPTS => {
                    debug!(address = %address, attempt, error = %e, "Transient connect failure, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(PROBE_CONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
        // Loop always returns or stores an error first.
        Err(last_err.unwrap_or_else(|| {
            SessionError::Driver("connect retry loop exhausted without an error".to_string())
        }))
    }
}

#[async_trait]
impl<F: SessionFactory> Topology for TopologyProber<F> {
    #[instrument(skip(self), fields(address = %address))]
    async fn probe(&self, address: &InstanceAddress) -> Result<InstanceSnapshot, ProbeError> {
        let mut session = self.connect_with_retry(address).await?;

        let identity = session
            .query_one(
                "SELECT @@server_uuid AS server_uuid, @@server_id AS server_id, \
                 @@version AS version, @@report_host AS report_host",
                &[],
            )
            .await?
            .ok_or_else(|| SessionError::Malformed("no identity row".to_string()))?;

        let gtids = session
            .query_one(
                "SELECT @@global.gtid_executed AS gtid_executed, \
                 @@global.gtid_purged AS gtid_purged",
                &[],
            )
            .await?
            .ok_or_else(|| SessionError::Malformed("no GTID row".to_string()))?;

        let member_row = session
            .query_one(
                "SELECT MEMBER_STATE FROM performance_schema.replication_group_members \
                 WHERE MEMBER_ID = @@server_uuid",
                &[],
            )
            .await?;

        let channel_rows = session
            .query(
                "SELECT c.CHANNEL_NAME, c.HOST, c.PORT, c.USER, \
                 c.CONNECTION_RETRY_INTERVAL, c.CONNECTION_RETRY_COUNT, \
                 c.HEARTBEAT_INTERVAL, c.COMPRESSION_ALGORITHM, \
                 c.ZSTD_COMPRESSION_LEVEL, c.NETWORK_INTERFACE, c.NETWORK_NAMESPACE, \
                 s.SERVICE_STATE AS IO_STATE, a.SERVICE_STATE AS SQL_STATE, \
                 s.LAST_ERROR_NUMBER, s.LAST_ERROR_MESSAGE \
                 FROM performance_schema.replication_connection_configuration c \
                 LEFT JOIN performance_schema.replication_connection_status s \
                   ON s.CHANNEL_NAME = c.CHANNEL_NAME \
                 LEFT JOIN performance_schema.replication_applier_status a \
                   ON a.CHANNEL_NAME = c.CHANNEL_NAME",
                &[],
            )
            .await?;

        let member_state = match member_row {
            Some(row) => parse_member_state(&row)?,
            None => MemberState::Offline,
        };

        let channels = channel_rows
            .iter()
            .map(parse_channel_row)
            .collect::<Result<Vec<_>, _>>()?;

        let server_id = u32::try_from(identity.req_u64("server_id")?)
            .map_err(|_| SessionError::Malformed("server_id out of range".to_string()))?;

        Ok(InstanceSnapshot {
            address: address.clone(),
            server_uuid: identity.req_str("server_uuid")?,
            server_id,
            version: ServerVersion::parse(&identity.req_str("version")?)?,
            report_host: identity.str_opt("report_host").filter(|h| !h.is_empty()),
            member_state,
            gtid_executed: GtidSet::parse(&gtids.req_str("gtid_executed")?)?,
            gtid_purged: GtidSet::parse(&gtids.req_str("gtid_purged")?)?,
            channels,
        })
    }

    #[instrument(skip(self), fields(via = %via))]
    async fn members(&self, via: &InstanceAddress) -> Result<Vec<GroupMember>, ProbeError> {
        let mut session = self.connect_with_retry(via).await?;
        let rows = session
            .query(
                "SELECT MEMBER_ID, MEMBER_HOST, MEMBER_PORT, MEMBER_STATE, MEMBER_ROLE \
                 FROM performance_schema.replication_group_members",
                &[],
            )
            .await?;

        let mut members = Vec::with_capacity(rows.len());
        for row in &rows {
            let host = row.req_str("MEMBER_HOST")?;
            let port = u16::try_from(row.req_u64("MEMBER_PORT")?)
                .map_err(|_| SessionError::Malformed("member port out of range".to_string()))?;
            let role = match row.str_opt("MEMBER_ROLE").as_deref() {
                Some("PRIMARY") => MemberRole::Primary,
                _ => MemberRole::Secondary,
            };
            members.push(GroupMember {
                server_uuid: row.req_str("MEMBER_ID")?,
                address: InstanceAddress::new(&host, port),
                state: parse_member_state(row)?,
                role,
            });
        }
        Ok(members)
    }
}

/// Wait until the instance's executed GTID set covers `target`.
///
/// Bounded by `timeout` (`dba.gtidWaitTimeout`); expiry is a recoverable
/// [`ProbeError::Timeout`], never a crash.
#[instrument(skip(topology, target), fields(address = %address))]
pub async fn wait_for_gtid_sync(
    topology: &dyn Topology,
    address: &InstanceAddress,
    target: &GtidSet,
    timeout: Duration,
) -> Result<(), ProbeError> {
    let start = std::time::Instant::now();
    loop {
        match topology.probe(address).await {
            Ok(snapshot) => {
                if target.is_subset_of(&snapshot.gtid_executed) {
                    debug!("Transaction set synchronized");
                    return Ok(());
                }
                let missing = target.subtract(&snapshot.gtid_executed);
                debug!(missing = %missing, "Waiting for transaction sync");
            }
            Err(e) => {
                warn!(error = %e, "Error while waiting for transaction sync");
            }
        }
        if start.elapsed() > timeout {
            return Err(ProbeError::Timeout {
                operation: format!("transaction sync on '{}'", address),
                duration: timeout,
            });
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Wait until the instance reports ONLINE group membership.
#[instrument(skip(topology), fields(address = %address))]
pub async fn wait_for_member_online(
    topology: &dyn Topology,
    address: &InstanceAddress,
    timeout: Duration,
) -> Result<(), ProbeError> {
    let start = std::time::Instant::now();
    loop {
        match topology.probe(address).await {
            Ok(snapshot) if snapshot.member_state == MemberState::Online => {
                debug!("Member is ONLINE");
                return Ok(());
            }
            Ok(snapshot) => {
                debug!(state = %snapshot.member_state, "Member not yet ONLINE");
            }
            Err(e) => {
                warn!(error = %e, "Error checking member state");
            }
        }
        if start.elapsed() > timeout {
            return Err(ProbeError::Timeout {
                operation: format!("member ONLINE on '{}'", address),
                duration: timeout,
            });
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Wait for an instance to come back after a clone-triggered restart.
///
/// The server drops all connections and restarts itself at the end of a
/// remote clone, so connectivity errors here are the expected path until
/// the restart completes. Bounded by `dba.restartWaitTimeout`.
#[instrument(skip(topology), fields(address = %address))]
pub async fn wait_for_restart(
    topology: &dyn Topology,
    address: &InstanceAddress,
    timeout: Duration,
) -> Result<InstanceSnapshot, ProbeError> {
    let start = std::time::Instant::now();
    loop {
        match topology.probe(address).await {
            Ok(snapshot) => {
                debug!("Instance is back after restart");
                return Ok(snapshot);
            }
            Err(e) if e.is_connectivity() => {
                debug!(error = %e, "Instance still restarting");
            }
            Err(e) => return Err(e),
        }
        if start.elapsed() > timeout {
            return Err(ProbeError::Timeout {
                operation: format!("restart of '{}'", address),
                duration: timeout,
            });
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}
