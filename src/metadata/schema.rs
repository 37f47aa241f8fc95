//! Metadata schema versioning.
//!
//! The engine reads the deployed schema version once per store and adapts
//! its queries: the legacy 1.0.x layout keeps router host information in a
//! separate `hosts` table, merged into the unified `routers` shape for
//! callers.

use semver::Version;

/// Schema name used by all metadata queries.
pub const METADATA_SCHEMA: &str = "mysql_innodb_cluster_metadata";

/// Newest schema version this engine writes.
pub fn current_version() -> Version {
    Version::new(2, 3, 0)
}

/// Whether the deployed schema predates the unified 2.0 layout.
pub fn is_legacy(version: &Version) -> bool {
    version.major < 2
}
