//! Row parsers for the server-side replication status views.
//!
//! The prober issues plain SELECTs against `performance_schema` views and
//! system variables; the functions here turn the resulting rows into the
//! typed model in [`crate::client::types`]. All of them are pure and
//! testable with hand-built rows.

use crate::client::session::SqlRow;
use crate::client::types::{
    InstanceAddress, MemberState, ParseError, ReplicationChannelStatus,
};
use crate::controller::repl_options::ReplicationOptions;

/// Parse the member state column of a
/// `performance_schema.replication_group_members` row.
pub fn parse_member_state(row: &SqlRow) -> Result<MemberState, ParseError> {
    row.str_opt("MEMBER_STATE")
        .ok_or_else(|| ParseError::MissingField("MEMBER_STATE".to_string()))?
        .parse()
}

/// Parse one row of the channel configuration/status join.
///
/// Expected columns (from `replication_connection_configuration` joined with
/// `replication_connection_status` and `replication_applier_status`):
/// `CHANNEL_NAME`, `HOST`, `PORT`, `USER`, `CONNECTION_RETRY_INTERVAL`,
/// `CONNECTION_RETRY_COUNT`, `HEARTBEAT_INTERVAL`, `COMPRESSION_ALGORITHM`,
/// `ZSTD_COMPRESSION_LEVEL`, `NETWORK_INTERFACE`, `NETWORK_NAMESPACE`,
/// `IO_STATE`, `SQL_STATE`, `LAST_ERROR_NUMBER`, `LAST_ERROR_MESSAGE`.
pub fn parse_channel_row(row: &SqlRow) -> Result<ReplicationChannelStatus, ParseError> {
    let channel_name = row
        .str_opt("CHANNEL_NAME")
        .ok_or_else(|| ParseError::MissingField("CHANNEL_NAME".to_string()))?;

    let source = match (row.str_opt("HOST"), row.i64_opt("PORT")) {
        (Some(host), Some(port)) if !host.is_empty() && port > 0 => Some(InstanceAddress::new(
            host,
            u16::try_from(port).map_err(|_| ParseError::InvalidAddress(port.to_string()))?,
        )),
        _ => None,
    };

    // Empty strings in the configuration view mean "not configured".
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

    let options = ReplicationOptions {
        connect_retry: row.i64_opt("CONNECTION_RETRY_INTERVAL"),
        retry_count: row.i64_opt("CONNECTION_RETRY_COUNT"),
        heartbeat_period: row.f64_opt("HEARTBEAT_INTERVAL"),
        compression_algorithms: non_empty(row.str_opt("COMPRESSION_ALGORITHM")),
        zstd_compression_level: row.i64_opt("ZSTD_COMPRESSION_LEVEL"),
        bind: non_empty(row.str_opt("NETWORK_INTERFACE")),
        network_namespace: non_empty(row.str_opt("NETWORK_NAMESPACE")),
    };

    Ok(ReplicationChannelStatus {
        channel_name,
        source,
        user: row.str_opt("USER").unwrap_or_default(),
        io_running: service_state_running(row.str_opt("IO_STATE").as_deref()),
        sql_running: service_state_running(row.str_opt("SQL_STATE").as_deref()),
        last_error_number: row.i64_opt("LAST_ERROR_NUMBER").unwrap_or(0),
        last_error_message: row.str_opt("LAST_ERROR_MESSAGE").unwrap_or_default(),
        options,
    })
}

fn service_state_running(state: Option<&str>) -> bool {
    matches!(state, Some("ON") | Some("CONNECTING"))
}
