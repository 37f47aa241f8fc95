//! Router metadata bookkeeping.
//!
//! Routers register themselves in the metadata and are only ever listed or
//! deregistered from here. Upgrade pressure is computed against the
//! deployed metadata schema version: the minimum compatible router version
//! moves as the schema evolves, so the boundary is data, not a constant.

use semver::Version;
use tracing::{info, instrument};

use crate::controller::error::{Error, Result};
use crate::controller::membership::Cluster;
use crate::metadata::types::RouterRecord;

/// Minimum router version per metadata schema version, ordered ascending by
/// schema version. The highest entry not above the deployed schema applies.
#[derive(Debug, Clone)]
pub struct RouterCompatTable {
    entries: Vec<(Version, Version)>,
}

impl Default for RouterCompatTable {
    fn default() -> Self {
        Self {
            entries: vec![
                (Version::new(1, 0, 0), Version::new(1, 0, 0)),
                // Schema 2.x dropped the hosts table; older routers cannot
                // read it.
                (Version::new(2, 0, 0), Version::new(8, 0, 19)),
            ],
        }
    }
}

impl RouterCompatTable {
    pub fn new(entries: Vec<(Version, Version)>) -> Self {
        Self { entries }
    }

    /// The minimum router version able to work with the given schema.
    pub fn minimum_for(&self, schema: &Version) -> Option<&Version> {
        self.entries
            .iter()
            .rev()
            .find(|(at_least, _)| schema >= at_least)
            .map(|(_, min)| min)
    }

    /// Whether a router reporting `version` needs an upgrade under `schema`.
    /// Routers with no parseable version predate version reporting and
    /// always need one.
    pub fn upgrade_required(&self, schema: &Version, version: Option<&str>) -> bool {
        let Some(minimum) = self.minimum_for(schema) else {
            return false;
        };
        match version.and_then(parse_router_version) {
            Some(v) => &v < minimum,
            None => true,
        }
    }
}

/// Router versions are usually plain semver but may lack the patch part.
fn parse_router_version(s: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some(Version::new(major, minor, 0))
}

/// A router row annotated with upgrade pressure.
#[derive(Debug)]
pub struct RouterInfo {
    pub record: RouterRecord,
    pub upgrade_required: bool,
    /// When the router last refreshed its registration, if it ever did.
    pub last_check_in: Option<jiff::civil::DateTime>,
}

/// Split a `hostname::label` router identifier.
///
/// The shape is strict: exactly one `::` separator, a non-empty hostname,
/// and no stray colons on either side. Anything else is an argument error
/// naming the offending identifier.
pub fn parse_router_identifier(identifier: &str) -> Result<(String, String)> {
    let invalid = || {
        Error::Argument(format!(
            "Invalid router identifier '{}': expected 'hostname::label'",
            identifier
        ))
    };

    let (hostname, label) = identifier.split_once("::").ok_or_else(invalid)?;
    if hostname.is_empty() || hostname.contains(':') || label.contains(':') {
        return Err(invalid());
    }
    Ok((hostname.to_string(), label.to_string()))
}

impl Cluster {
    /// List registered routers, each annotated with `upgradeRequired`.
    pub async fn list_routers(&mut self, only_upgrade_required: bool) -> Result<Vec<RouterInfo>> {
        self.ensure_usable()?;
        let schema = self.context.metadata.schema_version().await?;

        let mut routers = Vec::new();
        for record in self.context.metadata.routers().await? {
            let upgrade_required = self
                .router_compat
                .upgrade_required(&schema, record.version.as_deref());
            if only_upgrade_required && !upgrade_required {
                continue;
            }
            routers.push(RouterInfo {
                last_check_in: record.last_check_in_time(),
                record,
                upgrade_required,
            });
        }
        Ok(routers)
    }

    /// Deregister a router by its `hostname::label` identifier.
    ///
    /// The write always goes through the primary, whichever member the
    /// caller happened to connect to.
    #[instrument(skip(self), fields(identifier = %identifier))]
    pub async fn remove_router_metadata(&mut self, identifier: &str) -> Result<()> {
        self.ensure_usable()?;
        let (hostname, label) = parse_router_identifier(identifier)?;

        let routers = self.context.metadata.routers().await?;
        let router = routers
            .iter()
            .find(|r| r.hostname == hostname && r.label == label)
            .ok_or_else(|| {
                Error::Metadata(format!(
                    "The router '{}' is not registered in the metadata",
                    identifier
                ))
            })?;

        self.context.metadata.remove_router(router.router_id).await?;
        info!(identifier = %identifier, "Router metadata removed");
        Ok(())
    }
}
