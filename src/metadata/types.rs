//! Persistent metadata record types.
//!
//! These mirror the rows of the metadata schema: `clusters`, `instances`
//! and `routers`. JSON attribute columns are kept as maps so attribute
//! writes can merge instead of replace.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::controller::repl_options::ReplicationOptions;

/// Attribute keys on instance rows.
pub const ATTR_RECOVERY_ACCOUNT_USER: &str = "recoveryAccountUser";
pub const ATTR_RECOVERY_ACCOUNT_HOST: &str = "recoveryAccountHost";
pub const ATTR_SERVER_ID: &str = "server_id";
pub const ATTR_CERT_SUBJECT: &str = "opt_certSubject";
/// Set on a former primary that was left behind by a forced failover.
pub const ATTR_INVALIDATED: &str = "invalidated";

/// Attribute keys on cluster rows.
pub const ATTR_MEMBER_AUTH_TYPE: &str = "opt_memberAuthType";
pub const ATTR_CERT_ISSUER: &str = "opt_certIssuer";
pub const ATTR_REPLICATION_SSL_MODE: &str = "opt_replicationSslMode";
pub const ATTR_GTID_SET_IS_COMPLETE: &str = "opt_gtidSetIsComplete";
/// Host pattern recovery accounts are created for (default `%`).
pub const ATTR_REPLICATION_ALLOWED_HOST: &str = "opt_replicationAllowedHost";

/// Kind of managed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    /// InnoDB Cluster on Group Replication.
    GroupReplication,
    /// Async-replication replica set.
    AsyncReplication,
}

impl ClusterType {
    /// Naming prefix for per-instance recovery accounts.
    pub fn recovery_account_prefix(&self) -> &'static str {
        match self {
            ClusterType::GroupReplication => "mysql_innodb_cluster_",
            ClusterType::AsyncReplication => "mysql_innodb_rs_",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::GroupReplication => "gr",
            ClusterType::AsyncReplication => "ar",
        }
    }
}

impl FromStr for ClusterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gr" => Ok(ClusterType::GroupReplication),
            "ar" => Ok(ClusterType::AsyncReplication),
            other => Err(format!("unknown cluster type '{}'", other)),
        }
    }
}

/// Primary election mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMode {
    SinglePrimary,
    MultiPrimary,
}

impl TopologyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyMode::SinglePrimary => "pm",
            TopologyMode::MultiPrimary => "mm",
        }
    }
}

impl FromStr for TopologyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm" => Ok(TopologyMode::SinglePrimary),
            "mm" => Ok(TopologyMode::MultiPrimary),
            other => Err(format!("unknown topology mode '{}'", other)),
        }
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::SinglePrimary => write!(f, "Single-Primary"),
            TopologyMode::MultiPrimary => write!(f, "Multi-Primary"),
        }
    }
}

/// The per-protocol endpoints stored in an instance row's `addresses` JSON.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceAddresses {
    pub mysql_classic: String,
    pub mysql_x: Option<String>,
    pub gr_local: Option<String>,
}

impl InstanceAddresses {
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "mysqlClassic".to_string(),
            Value::from(self.mysql_classic.as_str()),
        );
        if let Some(x) = &self.mysql_x {
            map.insert("mysqlX".to_string(), Value::from(x.as_str()));
        }
        if let Some(gr) = &self.gr_local {
            map.insert("grLocal".to_string(), Value::from(gr.as_str()));
        }
        Value::Object(map)
    }

    pub fn from_json(value: &Value) -> Self {
        let get = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            mysql_classic: get("mysqlClassic").unwrap_or_default(),
            mysql_x: get("mysqlX"),
            gr_local: get("grLocal"),
        }
    }
}

/// One row of the `instances` table.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub server_uuid: String,
    /// Canonical `host:port` address; uniquely identifies the row.
    pub address: String,
    pub label: String,
    pub addresses: InstanceAddresses,
    pub attributes: Map<String, Value>,
}

impl InstanceRecord {
    pub fn server_id(&self) -> Option<u32> {
        self.attributes
            .get(ATTR_SERVER_ID)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn set_server_id(&mut self, server_id: u32) {
        self.attributes
            .insert(ATTR_SERVER_ID.to_string(), Value::from(server_id));
    }

    /// The recovery account `(user, host)` recorded for this instance.
    pub fn recovery_account(&self) -> Option<(String, String)> {
        let user = self
            .attributes
            .get(ATTR_RECOVERY_ACCOUNT_USER)
            .and_then(Value::as_str)?;
        let host = self
            .attributes
            .get(ATTR_RECOVERY_ACCOUNT_HOST)
            .and_then(Value::as_str)
            .unwrap_or("%");
        if user.is_empty() {
            return None;
        }
        Some((user.to_string(), host.to_string()))
    }

    pub fn set_recovery_account(&mut self, user: &str, host: &str) {
        self.attributes
            .insert(ATTR_RECOVERY_ACCOUNT_USER.to_string(), Value::from(user));
        self.attributes
            .insert(ATTR_RECOVERY_ACCOUNT_HOST.to_string(), Value::from(host));
    }

    /// Declared (metadata-side) replication options.
    pub fn replication_options(&self) -> ReplicationOptions {
        ReplicationOptions::from_attributes(&self.attributes)
    }

    /// Whether a forced failover left this instance behind.
    pub fn is_invalidated(&self) -> bool {
        self.attributes
            .get(ATTR_INVALIDATED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One row of the `clusters` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRecord {
    pub cluster_id: String,
    pub name: String,
    pub cluster_type: ClusterType,
    pub topology_mode: TopologyMode,
    pub attributes: Map<String, Value>,
}

impl ClusterRecord {
    pub fn gtid_set_is_complete(&self) -> bool {
        self.attributes
            .get(ATTR_GTID_SET_IS_COMPLETE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Host pattern for recovery accounts, `%` unless configured.
    pub fn replication_allowed_host(&self) -> String {
        self.attributes
            .get(ATTR_REPLICATION_ALLOWED_HOST)
            .and_then(Value::as_str)
            .unwrap_or("%")
            .to_string()
    }
}

/// One row of the `routers` table (or the legacy `routers` + `hosts` join).
#[derive(Debug, Clone, PartialEq)]
pub struct RouterRecord {
    pub router_id: u64,
    /// The label part of the `hostname::label` identifier; may be empty.
    pub label: String,
    pub hostname: String,
    pub version: Option<String>,
    pub last_check_in: Option<String>,
    pub attributes: Map<String, Value>,
}

impl RouterRecord {
    /// The `hostname::label` identifier users address this router by.
    pub fn identifier(&self) -> String {
        format!("{}::{}", self.hostname, self.label)
    }

    /// The `last_check_in` column as a point in civil time. The metadata
    /// stores MySQL DATETIME text with no zone information.
    pub fn last_check_in_time(&self) -> Option<jiff::civil::DateTime> {
        let raw = self.last_check_in.as_deref()?;
        jiff::civil::DateTime::strptime("%Y-%m-%d %H:%M:%S", raw).ok()
    }

    /// An endpoint attribute, passed through as an opaque string. Routers
    /// have been observed writing non-numeric port values; listing must not
    /// fail on them.
    pub fn endpoint(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}
