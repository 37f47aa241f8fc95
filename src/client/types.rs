//! Parsed live-state model for managed MySQL instances.
//!
//! These types represent what the topology prober reads off a running
//! server: member state, server version, GTID sets and replication channel
//! status. [`GtidSet`] carries the interval algebra the recovery-method
//! arbiter is built on.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::controller::repl_options::ReplicationOptions;

/// Errors that can occur when parsing live server state.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Invalid instance address: {0}")]
    InvalidAddress(String),
    #[error("Invalid GTID set: {0}")]
    InvalidGtidSet(String),
    #[error("Invalid member state: {0}")]
    InvalidMemberState(String),
    #[error("Invalid server version: {0}")]
    InvalidVersion(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// A classic-protocol endpoint of a managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceAddress {
    host: String,
    port: u16,
}

impl InstanceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Default X-protocol port derived from the classic port.
    pub fn x_port(&self) -> u32 {
        u32::from(self.port) * 10
    }

    /// Whether the host part is a loopback alias. Loopback aliases are
    /// interchangeable when matching a user-supplied address against stored
    /// metadata.
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl FromStr for InstanceAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }
        let port = port_str
            .parse()
            .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Group Replication member state as reported by
/// `performance_schema.replication_group_members`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Online,
    Offline,
    Recovering,
    Unreachable,
    Error,
    /// Listed in the group view but no longer reporting ("(MISSING)").
    Missing,
}

impl FromStr for MemberState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ONLINE" => Ok(MemberState::Online),
            "OFFLINE" => Ok(MemberState::Offline),
            "RECOVERING" => Ok(MemberState::Recovering),
            "UNREACHABLE" => Ok(MemberState::Unreachable),
            "ERROR" => Ok(MemberState::Error),
            "(MISSING)" | "MISSING" => Ok(MemberState::Missing),
            _ => Err(ParseError::InvalidMemberState(s.to_string())),
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Online => write!(f, "ONLINE"),
            MemberState::Offline => write!(f, "OFFLINE"),
            MemberState::Recovering => write!(f, "RECOVERING"),
            MemberState::Unreachable => write!(f, "UNREACHABLE"),
            MemberState::Error => write!(f, "ERROR"),
            MemberState::Missing => write!(f, "(MISSING)"),
        }
    }
}

/// A MySQL server version, keeping the raw string for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    version: semver::Version,
    raw: String,
}

impl ServerVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        let version = semver::Version::new(major, minor, patch);
        let raw = version.to_string();
        Self { version, raw }
    }

    /// Parse a `@@version` string such as `8.0.17-debug` or `5.7.44-log`.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        use std::sync::LazyLock;
        static VERSION_RE: LazyLock<Option<regex::Regex>> =
            LazyLock::new(|| regex::Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?").ok());

        let caps = VERSION_RE
            .as_ref()
            .and_then(|re| re.captures(raw))
            .ok_or_else(|| ParseError::InvalidVersion(raw.to_string()))?;
        let field = |i: usize| -> u64 {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Ok(Self {
            version: semver::Version::new(field(1), field(2), field(3)),
            raw: raw.to_string(),
        })
    }

    pub fn semver(&self) -> &semver::Version {
        &self.version
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        self.version >= semver::Version::new(major, minor, patch)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A GTID set: per-source-UUID lists of closed transaction-id intervals.
///
/// Intervals are kept normalized (sorted, merged, non-overlapping), so
/// equality and subset checks are structural.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GtidSet {
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the `@@gtid_executed` text form, e.g.
    /// `uuid1:1-5:7,uuid2:1-3`. Whitespace and newlines between entries are
    /// tolerated, matching server output.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let mut set = GtidSet::empty();
        for entry in s.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.split(':');
            let uuid = parts
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| ParseError::InvalidGtidSet(entry.to_string()))?
                .to_lowercase();
            let mut ranges = Vec::new();
            for range in parts {
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => {
                        let a = a
                            .parse()
                            .map_err(|_| ParseError::InvalidGtidSet(entry.to_string()))?;
                        let b = b
                            .parse()
                            .map_err(|_| ParseError::InvalidGtidSet(entry.to_string()))?;
                        (a, b)
                    }
                    None => {
                        let v: u64 = range
                            .parse()
                            .map_err(|_| ParseError::InvalidGtidSet(entry.to_string()))?;
                        (v, v)
                    }
                };
                if start == 0 || end < start {
                    return Err(ParseError::InvalidGtidSet(entry.to_string()));
                }
                ranges.push((start, end));
            }
            if ranges.is_empty() {
                return Err(ParseError::InvalidGtidSet(entry.to_string()));
            }
            set.intervals.entry(uuid).or_default().extend(ranges);
        }
        for ranges in set.intervals.values_mut() {
            normalize(ranges);
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of transactions in the set.
    pub fn count(&self) -> u64 {
        self.intervals
            .values()
            .flatten()
            .map(|(s, e)| e - s + 1)
            .sum()
    }

    /// Set union.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut out = self.clone();
        for (uuid, ranges) in &other.intervals {
            let entry = out.intervals.entry(uuid.clone()).or_default();
            entry.extend(ranges.iter().copied());
            normalize(entry);
        }
        out
    }

    /// Set difference: transactions in `self` that are not in `other`.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut out = GtidSet::empty();
        for (uuid, ranges) in &self.intervals {
            let missing = match other.intervals.get(uuid) {
                None => ranges.clone(),
                Some(theirs) => subtract_ranges(ranges, theirs),
            };
            if !missing.is_empty() {
                out.intervals.insert(uuid.clone(), missing);
            }
        }
        out
    }

    /// Whether every transaction in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }
}

fn normalize(ranges: &mut Vec<(u64, u64)>) {
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        match merged.last_mut() {
            // Adjacent intervals merge too: 1-3 + 4-5 => 1-5
            Some((_, last_end)) if start <= last_end.saturating_add(1) => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    *ranges = merged;
}

fn subtract_ranges(ours: &[(u64, u64)], theirs: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    for &(start, end) in ours {
        let mut cursor = start;
        for &(ts, te) in theirs {
            if te < cursor || ts > end {
                continue;
            }
            if ts > cursor {
                out.push((cursor, ts - 1));
            }
            cursor = te.saturating_add(1);
            if cursor > end {
                break;
            }
        }
        if cursor <= end {
            out.push((cursor, end));
        }
    }
    out
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, ranges) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for (start, end) in ranges {
                if start == end {
                    write!(f, ":{}", start)?;
                } else {
                    write!(f, ":{}-{}", start, end)?;
                }
            }
        }
        Ok(())
    }
}

/// Outcome of comparing a joining target's GTID state against the donor.
///
/// Purged scenarios (the replicaset purged transactions the target still
/// needs) must stay distinct from errant scenarios (the target has
/// transactions the replicaset never saw): they drive different arbiter
/// branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidComparison {
    /// Target and donor have the same executed set.
    Identical,
    /// Target has no transactions at all.
    Empty,
    /// Target's transactions are a strict subset of the donor's, and none
    /// of the missing ones were purged.
    Subset,
    /// Target has transactions the replicaset does not.
    Errant,
    /// The replicaset purged transactions the target lacks.
    Purged,
    /// Both conditions at once.
    ErrantAndPurged,
}

impl GtidComparison {
    /// Classify a target against a donor.
    ///
    /// `donor_purged` is the donor's `@@gtid_purged`: transactions no longer
    /// available in its binary logs.
    pub fn classify(
        target_executed: &GtidSet,
        donor_executed: &GtidSet,
        donor_purged: &GtidSet,
    ) -> GtidComparison {
        let errant = !target_executed.subtract(donor_executed).is_empty();
        let needs_purged = !donor_purged.subtract(target_executed).is_empty();

        match (errant, needs_purged) {
            (true, true) => GtidComparison::ErrantAndPurged,
            (true, false) => GtidComparison::Errant,
            (false, true) => GtidComparison::Purged,
            (false, false) => {
                if target_executed == donor_executed {
                    GtidComparison::Identical
                } else if target_executed.is_empty() {
                    GtidComparison::Empty
                } else {
                    GtidComparison::Subset
                }
            }
        }
    }

    /// Whether incremental recovery is safe for this state.
    pub fn incremental_safe(&self) -> bool {
        matches!(
            self,
            GtidComparison::Identical | GtidComparison::Empty | GtidComparison::Subset
        )
    }

    /// Whether the target carries errant transactions.
    pub fn has_errant(&self) -> bool {
        matches!(
            self,
            GtidComparison::Errant | GtidComparison::ErrantAndPurged
        )
    }
}

/// Live status of one replication channel, joined from the connection
/// configuration and status views. Ephemeral: derived at query time, never
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationChannelStatus {
    pub channel_name: String,
    pub source: Option<InstanceAddress>,
    /// The user the channel authenticates with. Drives recovery-account
    /// cleanup and repair.
    pub user: String,
    pub io_running: bool,
    pub sql_running: bool,
    pub last_error_number: i64,
    pub last_error_message: String,
    /// The channel's live option values, for drift reporting.
    pub options: ReplicationOptions,
}

impl ReplicationChannelStatus {
    pub fn is_running(&self) -> bool {
        self.io_running && self.sql_running
    }
}

/// Everything the prober learns about one reachable instance in one pass.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub server_id: u32,
    pub version: ServerVersion,
    /// The host the server reports itself as (`@@report_host`), which may
    /// have drifted from the stored metadata address.
    pub report_host: Option<String>,
    pub member_state: MemberState,
    pub gtid_executed: GtidSet,
    pub gtid_purged: GtidSet,
    pub channels: Vec<ReplicationChannelStatus>,
}

impl InstanceSnapshot {
    /// The replication channel the engine manages, if configured.
    pub fn managed_channel(&self, name: &str) -> Option<&ReplicationChannelStatus> {
        self.channels.iter().find(|c| c.channel_name == name)
    }
}
