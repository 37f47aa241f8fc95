//! Instance resolution against metadata.
//!
//! Callers name instances by address, but the stored address can drift from
//! what the server currently reports. Matching therefore prefers the server
//! UUID when a live probe is available and only then falls back through
//! address equality and localhost aliases.

use crate::client::types::{InstanceAddress, InstanceSnapshot};
use crate::metadata::types::InstanceRecord;

/// Find the metadata record for `target`, preferring UUID identity from a
/// live `snapshot` over textual address comparison.
pub fn resolve_instance<'a>(
    records: &'a [InstanceRecord],
    target: &InstanceAddress,
    snapshot: Option<&InstanceSnapshot>,
) -> Option<&'a InstanceRecord> {
    if let Some(snap) = snapshot
        && let Some(record) = records.iter().find(|r| r.server_uuid == snap.server_uuid)
    {
        return Some(record);
    }
    records.iter().find(|r| {
        r.address
            .parse::<InstanceAddress>()
            .is_ok_and(|stored| addresses_match(&stored, target))
    })
}

/// Address equality with localhost aliasing. A stored `localhost:3306` and
/// a queried `127.0.0.1:3306` name the same endpoint.
pub fn addresses_match(a: &InstanceAddress, b: &InstanceAddress) -> bool {
    if a.port() != b.port() {
        return false;
    }
    if a.host().eq_ignore_ascii_case(b.host()) {
        return true;
    }
    a.is_local() && b.is_local()
}
