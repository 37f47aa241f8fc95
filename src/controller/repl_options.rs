//! Replication channel option reconciliation.
//!
//! Each option is independently nullable: `None` means "not configured".
//! Because some channel parameters cannot be changed incrementally, a
//! declared `None` over a live configured value forces a full channel reset
//! (`RESET REPLICA ALL`) on the next rejoin rather than a soft reconfigure.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tolerance when comparing heartbeat periods. The server stores the value
/// with limited precision, so differences below this are treated as equal
/// to keep floating-point jitter from triggering spurious channel work.
pub const HEARTBEAT_EPSILON: f64 = 0.001;

/// Metadata attribute keys for the per-instance replication options.
pub const OPT_CONNECT_RETRY: &str = "opt_replConnectRetry";
pub const OPT_RETRY_COUNT: &str = "opt_replRetryCount";
pub const OPT_HEARTBEAT_PERIOD: &str = "opt_replHeartbeatPeriod";
pub const OPT_COMPRESSION_ALGORITHMS: &str = "opt_replCompressionAlgorithms";
pub const OPT_ZSTD_COMPRESSION_LEVEL: &str = "opt_replZstdCompressionLevel";
pub const OPT_BIND: &str = "opt_replBind";
pub const OPT_NETWORK_NAMESPACE: &str = "opt_replNetworkNamespace";

/// All settable option names, in reporting order.
pub const OPTION_NAMES: [&str; 7] = [
    "replConnectRetry",
    "replRetryCount",
    "replHeartbeatPeriod",
    "replCompressionAlgorithms",
    "replZstdCompressionLevel",
    "replBind",
    "replNetworkNamespace",
];

/// Per-instance replication channel options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOptions {
    pub connect_retry: Option<i64>,
    pub retry_count: Option<i64>,
    pub heartbeat_period: Option<f64>,
    pub compression_algorithms: Option<String>,
    pub zstd_compression_level: Option<i64>,
    pub bind: Option<String>,
    pub network_namespace: Option<String>,
}

/// What `rejoinInstance()` must do to a live channel to honor the declared
/// options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelUpdate {
    /// Live channel already matches the declared options.
    None,
    /// A `CHANGE REPLICATION SOURCE TO` suffices.
    Reconfigure,
    /// The channel must be torn down (`RESET REPLICA ALL`) and rebuilt,
    /// because a configured parameter has to be unset.
    Reset,
}

impl ReplicationOptions {
    pub fn is_default(&self) -> bool {
        *self == ReplicationOptions::default()
    }

    /// Set a single option by its public name. `None` clears it.
    /// Returns false if the name is unknown.
    pub fn set_by_name(&mut self, name: &str, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match name {
            "replConnectRetry" => self.connect_retry = value.and_then(Value::as_i64),
            "replRetryCount" => self.retry_count = value.and_then(Value::as_i64),
            "replHeartbeatPeriod" => self.heartbeat_period = value.and_then(Value::as_f64),
            "replCompressionAlgorithms" => {
                self.compression_algorithms =
                    value.and_then(Value::as_str).map(str::to_string)
            }
            "replZstdCompressionLevel" => {
                self.zstd_compression_level = value.and_then(Value::as_i64)
            }
            "replBind" => self.bind = value.and_then(Value::as_str).map(str::to_string),
            "replNetworkNamespace" => {
                self.network_namespace = value.and_then(Value::as_str).map(str::to_string)
            }
            _ => return false,
        }
        true
    }

    /// Read a single option by its public name.
    pub fn get_by_name(&self, name: &str) -> Option<Value> {
        match name {
            "replConnectRetry" => Some(json_opt_i64(self.connect_retry)),
            "replRetryCount" => Some(json_opt_i64(self.retry_count)),
            "replHeartbeatPeriod" => Some(
                self.heartbeat_period
                    .and_then(|v| serde_json::Number::from_f64(v).map(Value::Number))
                    .unwrap_or(Value::Null),
            ),
            "replCompressionAlgorithms" => Some(json_opt_str(&self.compression_algorithms)),
            "replZstdCompressionLevel" => Some(json_opt_i64(self.zstd_compression_level)),
            "replBind" => Some(json_opt_str(&self.bind)),
            "replNetworkNamespace" => Some(json_opt_str(&self.network_namespace)),
            _ => None,
        }
    }

    /// Load declared options from an instance's metadata attribute map.
    pub fn from_attributes(attributes: &Map<String, Value>) -> Self {
        let mut opts = ReplicationOptions::default();
        let pairs = [
            (OPT_CONNECT_RETRY, "replConnectRetry"),
            (OPT_RETRY_COUNT, "replRetryCount"),
            (OPT_HEARTBEAT_PERIOD, "replHeartbeatPeriod"),
            (OPT_COMPRESSION_ALGORITHMS, "replCompressionAlgorithms"),
            (OPT_ZSTD_COMPRESSION_LEVEL, "replZstdCompressionLevel"),
            (OPT_BIND, "replBind"),
            (OPT_NETWORK_NAMESPACE, "replNetworkNamespace"),
        ];
        for (attr, name) in pairs {
            opts.set_by_name(name, attributes.get(attr));
        }
        opts
    }

    /// Metadata attribute key for a public option name.
    pub fn attribute_key(name: &str) -> Option<&'static str> {
        match name {
            "replConnectRetry" => Some(OPT_CONNECT_RETRY),
            "replRetryCount" => Some(OPT_RETRY_COUNT),
            "replHeartbeatPeriod" => Some(OPT_HEARTBEAT_PERIOD),
            "replCompressionAlgorithms" => Some(OPT_COMPRESSION_ALGORITHMS),
            "replZstdCompressionLevel" => Some(OPT_ZSTD_COMPRESSION_LEVEL),
            "replBind" => Some(OPT_BIND),
            "replNetworkNamespace" => Some(OPT_NETWORK_NAMESPACE),
            _ => None,
        }
    }
}

fn json_opt_i64(v: Option<i64>) -> Value {
    v.map(Value::from).unwrap_or(Value::Null)
}

fn json_opt_str(v: &Option<String>) -> Value {
    v.as_deref().map(Value::from).unwrap_or(Value::Null)
}

fn heartbeat_equal(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() < HEARTBEAT_EPSILON,
        (None, None) => true,
        _ => false,
    }
}

/// Decide what the next `rejoinInstance()` must do to make the live channel
/// match the declared options.
pub fn required_update(declared: &ReplicationOptions, live: &ReplicationOptions) -> ChannelUpdate {
    // Any configured parameter that must become unconfigured forces a reset:
    // those cannot be cleared by CHANGE REPLICATION SOURCE TO.
    let must_reset = (declared.connect_retry.is_none() && live.connect_retry.is_some())
        || (declared.retry_count.is_none() && live.retry_count.is_some())
        || (declared.heartbeat_period.is_none() && live.heartbeat_period.is_some())
        || (declared.compression_algorithms.is_none() && live.compression_algorithms.is_some())
        || (declared.zstd_compression_level.is_none() && live.zstd_compression_level.is_some())
        || (declared.bind.is_none() && live.bind.is_some())
        || (declared.network_namespace.is_none() && live.network_namespace.is_some());
    if must_reset {
        return ChannelUpdate::Reset;
    }

    let changed = declared.connect_retry != live.connect_retry
        || declared.retry_count != live.retry_count
        || !heartbeat_equal(declared.heartbeat_period, live.heartbeat_period)
        || declared.compression_algorithms != live.compression_algorithms
        || declared.zstd_compression_level != live.zstd_compression_level
        || declared.bind != live.bind
        || declared.network_namespace != live.network_namespace;

    if changed {
        ChannelUpdate::Reconfigure
    } else {
        ChannelUpdate::None
    }
}

/// Describe declared-vs-live drift for `status()`. Non-fatal: the messages
/// go into the instance's `instanceErrors`, pointing the operator at
/// `rejoinInstance()`; the channel is never fixed silently.
pub fn drift_warnings(declared: &ReplicationOptions, live: &ReplicationOptions) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut add = |name: &str, declared: String, live: String| {
        warnings.push(format!(
            "WARNING: The replication option '{}' is set to '{}' in the metadata but the \
             channel is using '{}'. Call rejoinInstance() to update the channel.",
            name, declared, live
        ));
    };

    let fmt_i = |v: Option<i64>| v.map_or("<not set>".to_string(), |v| v.to_string());
    let fmt_f = |v: Option<f64>| v.map_or("<not set>".to_string(), |v| v.to_string());
    let fmt_s =
        |v: &Option<String>| v.clone().unwrap_or_else(|| "<not set>".to_string());

    if declared.connect_retry != live.connect_retry {
        add(
            "replConnectRetry",
            fmt_i(declared.connect_retry),
            fmt_i(live.connect_retry),
        );
    }
    if declared.retry_count != live.retry_count {
        add(
            "replRetryCount",
            fmt_i(declared.retry_count),
            fmt_i(live.retry_count),
        );
    }
    if !heartbeat_equal(declared.heartbeat_period, live.heartbeat_period) {
        add(
            "replHeartbeatPeriod",
            fmt_f(declared.heartbeat_period),
            fmt_f(live.heartbeat_period),
        );
    }
    if declared.compression_algorithms != live.compression_algorithms {
        add(
            "replCompressionAlgorithms",
            fmt_s(&declared.compression_algorithms),
            fmt_s(&live.compression_algorithms),
        );
    }
    if declared.zstd_compression_level != live.zstd_compression_level {
        add(
            "replZstdCompressionLevel",
            fmt_i(declared.zstd_compression_level),
            fmt_i(live.zstd_compression_level),
        );
    }
    if declared.bind != live.bind {
        add("replBind", fmt_s(&declared.bind), fmt_s(&live.bind));
    }
    if declared.network_namespace != live.network_namespace {
        add(
            "replNetworkNamespace",
            fmt_s(&declared.network_namespace),
            fmt_s(&live.network_namespace),
        );
    }
    warnings
}
