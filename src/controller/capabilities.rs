//! Version-gated server capabilities.

use crate::client::types::ServerVersion;

/// What a given server version can do. Derived once per instance and passed
/// around instead of sprinkling version comparisons through the controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceCapabilities {
    /// CLONE plugin provisioning is available.
    pub supports_clone: bool,
    /// SET PERSIST is available for durable sysvar changes.
    pub supports_set_persist: bool,
    /// MySQL communication stack for group replication.
    pub supports_communication_stack: bool,
}

impl InstanceCapabilities {
    pub fn from_version(version: &ServerVersion) -> Self {
        Self {
            supports_clone: version.at_least(8, 0, 17),
            supports_set_persist: version.at_least(8, 0, 11),
            supports_communication_stack: version.at_least(8, 0, 27),
        }
    }
}
