//! Metadata store accessor.
//!
//! CRUD over the persistent metadata schema through parameterized queries.
//! Writes to JSON attribute columns always merge (`JSON_SET` /
//! `JSON_REMOVE`) so unrelated attributes survive. A missing addressed row
//! raises a not-found [`MetadataError`], which callers can tell apart from
//! a connectivity failure.

pub mod schema;
pub mod types;

use async_trait::async_trait;
use semver::Version;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::client::session::{SessionError, SqlRow, SqlSession, SqlValue};
use schema::{METADATA_SCHEMA, is_legacy};
use types::{ClusterRecord, InstanceAddresses, InstanceRecord, RouterRecord};

pub use types::{ClusterType, TopologyMode};

/// Errors from the metadata layer.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Metadata for instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Router '{0}' is not registered in the metadata")]
    RouterNotFound(String),

    #[error("No cluster metadata found")]
    ClusterNotFound,

    #[error("Malformed metadata: {0}")]
    Malformed(String),
}

impl MetadataError {
    /// Whether this is a not-found condition rather than an access failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MetadataError::InstanceNotFound(_)
                | MetadataError::RouterNotFound(_)
                | MetadataError::ClusterNotFound
        )
    }
}

/// Persistent metadata operations.
///
/// Implemented over SQL by [`MetadataStore`]; tests provide an in-memory
/// implementation.
#[async_trait]
pub trait Metadata: Send {
    async fn schema_version(&mut self) -> Result<Version, MetadataError>;

    async fn cluster(&mut self) -> Result<ClusterRecord, MetadataError>;

    async fn create_cluster(&mut self, record: &ClusterRecord) -> Result<(), MetadataError>;

    async fn update_cluster_attribute(
        &mut self,
        key: &str,
        value: &Value,
    ) -> Result<(), MetadataError>;

    async fn instances(&mut self) -> Result<Vec<InstanceRecord>, MetadataError>;

    async fn insert_instance(&mut self, record: &InstanceRecord) -> Result<(), MetadataError>;

    async fn remove_instance(&mut self, address: &str) -> Result<(), MetadataError>;

    async fn update_instance_label(
        &mut self,
        address: &str,
        label: &str,
    ) -> Result<(), MetadataError>;

    async fn update_instance_uuid(
        &mut self,
        address: &str,
        server_uuid: &str,
    ) -> Result<(), MetadataError>;

    async fn update_instance_attribute(
        &mut self,
        address: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), MetadataError>;

    async fn remove_instance_attribute(
        &mut self,
        address: &str,
        key: &str,
    ) -> Result<(), MetadataError>;

    async fn routers(&mut self) -> Result<Vec<RouterRecord>, MetadataError>;

    async fn remove_router(&mut self, router_id: u64) -> Result<(), MetadataError>;

    /// Drop all cluster and instance rows (dissolve).
    async fn drop_cluster(&mut self) -> Result<(), MetadataError>;
}

/// SQL-backed [`Metadata`] implementation.
pub struct MetadataStore {
    session: Box<dyn SqlSession>,
    cached_version: Option<Version>,
}

impl MetadataStore {
    pub fn new(session: Box<dyn SqlSession>) -> Self {
        Self {
            session,
            cached_version: None,
        }
    }

    async fn version(&mut self) -> Result<Version, MetadataError> {
        if let Some(v) = &self.cached_version {
            return Ok(v.clone());
        }
        let row = self
            .session
            .query_one(
                &format!(
                    "SELECT major, minor, patch FROM {}.schema_version",
                    METADATA_SCHEMA
                ),
                &[],
            )
            .await?
            .ok_or(MetadataError::ClusterNotFound)?;
        let version = Version::new(
            row.req_u64("major")?,
            row.req_u64("minor")?,
            // Legacy versions predate the patch column.
            row.get("patch").and_then(SqlValue::as_u64).unwrap_or(0),
        );
        debug!(version = %version, "Detected metadata schema version");
        self.cached_version = Some(version.clone());
        Ok(version)
    }

    async fn instance_exists(&mut self, address: &str) -> Result<bool, MetadataError> {
        let row = self
            .session
            .query_one(
                &format!(
                    "SELECT COUNT(*) AS n FROM {}.instances WHERE address = ?",
                    METADATA_SCHEMA
                ),
                &[SqlValue::from(address)],
            )
            .await?;
        Ok(row.and_then(|r| r.i64_opt("n")).unwrap_or(0) > 0)
    }
}

/// Validate a JSON attribute key so it can be embedded in a JSON path.
fn check_attribute_key(key: &str) -> Result<(), MetadataError> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MetadataError::Malformed(format!(
            "invalid attribute key '{}'",
            key
        )));
    }
    Ok(())
}

fn parse_json_column(row: &SqlRow, column: &str) -> Result<Map<String, Value>, MetadataError> {
    match row.get(column) {
        None => Ok(Map::new()),
        Some(SqlValue::Null) => Ok(Map::new()),
        Some(v) => {
            let text = v
                .as_str()
                .ok_or_else(|| MetadataError::Malformed(format!("non-text JSON in '{}'", column)))?;
            let value: Value = serde_json::from_str(text)
                .map_err(|e| MetadataError::Malformed(format!("bad JSON in '{}': {}", column, e)))?;
            match value {
                Value::Object(map) => Ok(map),
                Value::Null => Ok(Map::new()),
                _ => Err(MetadataError::Malformed(format!(
                    "expected JSON object in '{}'",
                    column
                ))),
            }
        }
    }
}

fn parse_instance_row(row: &SqlRow) -> Result<InstanceRecord, MetadataError> {
    let addresses_json = row
        .str_opt("addresses")
        .map(|text| {
            serde_json::from_str::<Value>(&text)
                .map_err(|e| MetadataError::Malformed(format!("bad addresses JSON: {}", e)))
        })
        .transpose()?
        .unwrap_or(Value::Null);

    Ok(InstanceRecord {
        server_uuid: row.req_str("mysql_server_uuid")?,
        address: row.req_str("address")?,
        label: row.req_str("instance_name")?,
        addresses: InstanceAddresses::from_json(&addresses_json),
        attributes: parse_json_column(row, "attributes")?,
    })
}

#[async_trait]
impl Metadata for MetadataStore {
    async fn schema_version(&mut self) -> Result<Version, MetadataError> {
        self.version().await
    }

    async fn cluster(&mut self) -> Result<ClusterRecord, MetadataError> {
        let row = self
            .session
            .query_one(
                &format!(
                    "SELECT cluster_id, cluster_name, cluster_type, primary_mode, attributes \
                     FROM {}.clusters LIMIT 1",
                    METADATA_SCHEMA
                ),
                &[],
            )
            .await?
            .ok_or(MetadataError::ClusterNotFound)?;

        let cluster_type = row
            .req_str("cluster_type")?
            .parse()
            .map_err(MetadataError::Malformed)?;
        let topology_mode = row
            .req_str("primary_mode")?
            .parse()
            .map_err(MetadataError::Malformed)?;

        Ok(ClusterRecord {
            cluster_id: row.req_str("cluster_id")?,
            name: row.req_str("cluster_name")?,
            cluster_type,
            topology_mode,
            attributes: parse_json_column(&row, "attributes")?,
        })
    }

    #[instrument(skip(self, record), fields(name = %record.name))]
    async fn create_cluster(&mut self, record: &ClusterRecord) -> Result<(), MetadataError> {
        let attributes = serde_json::to_string(&Value::Object(record.attributes.clone()))
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        self.session
            .exec(
                &format!(
                    "INSERT INTO {}.clusters \
                     (cluster_id, cluster_name, cluster_type, primary_mode, attributes) \
                     VALUES (?, ?, ?, ?, CAST(? AS JSON))",
                    METADATA_SCHEMA
                ),
                &[
                    SqlValue::from(record.cluster_id.as_str()),
                    SqlValue::from(record.name.as_str()),
                    SqlValue::from(record.cluster_type.as_str()),
                    SqlValue::from(record.topology_mode.as_str()),
                    SqlValue::from(attributes),
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_cluster_attribute(
        &mut self,
        key: &str,
        value: &Value,
    ) -> Result<(), MetadataError> {
        check_attribute_key(key)?;
        let json = serde_json::to_string(value)
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        self.session
            .exec(
                &format!(
                    "UPDATE {}.clusters SET attributes = \
                     JSON_SET(COALESCE(attributes, '{{}}'), '$.\"{}\"', CAST(? AS JSON))",
                    METADATA_SCHEMA, key
                ),
                &[SqlValue::from(json)],
            )
            .await?;
        Ok(())
    }

    async fn instances(&mut self) -> Result<Vec<InstanceRecord>, MetadataError> {
        let rows = self
            .session
            .query(
                &format!(
                    "SELECT mysql_server_uuid, address, instance_name, addresses, attributes \
                     FROM {}.instances ORDER BY address",
                    METADATA_SCHEMA
                ),
                &[],
            )
            .await?;
        rows.iter().map(parse_instance_row).collect()
    }

    #[instrument(skip(self, record), fields(address = %record.address))]
    async fn insert_instance(&mut self, record: &InstanceRecord) -> Result<(), MetadataError> {
        let addresses = serde_json::to_string(&record.addresses.to_json())
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        let attributes = serde_json::to_string(&Value::Object(record.attributes.clone()))
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        self.session
            .exec(
                &format!(
                    "INSERT INTO {}.instances \
                     (mysql_server_uuid, address, instance_name, addresses, attributes) \
                     VALUES (?, ?, ?, CAST(? AS JSON), CAST(? AS JSON))",
                    METADATA_SCHEMA
                ),
                &[
                    SqlValue::from(record.server_uuid.as_str()),
                    SqlValue::from(record.address.as_str()),
                    SqlValue::from(record.label.as_str()),
                    SqlValue::from(addresses),
                    SqlValue::from(attributes),
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_instance(&mut self, address: &str) -> Result<(), MetadataError> {
        if !self.instance_exists(address).await? {
            return Err(MetadataError::InstanceNotFound(address.to_string()));
        }
        self.session
            .exec(
                &format!("DELETE FROM {}.instances WHERE address = ?", METADATA_SCHEMA),
                &[SqlValue::from(address)],
            )
            .await?;
        Ok(())
    }

    async fn update_instance_label(
        &mut self,
        address: &str,
        label: &str,
    ) -> Result<(), MetadataError> {
        if !self.instance_exists(address).await? {
            return Err(MetadataError::InstanceNotFound(address.to_string()));
        }
        self.session
            .exec(
                &format!(
                    "UPDATE {}.instances SET instance_name = ? WHERE address = ?",
                    METADATA_SCHEMA
                ),
                &[SqlValue::from(label), SqlValue::from(address)],
            )
            .await?;
        Ok(())
    }

    async fn update_instance_uuid(
        &mut self,
        address: &str,
        server_uuid: &str,
    ) -> Result<(), MetadataError> {
        if !self.instance_exists(address).await? {
            return Err(MetadataError::InstanceNotFound(address.to_string()));
        }
        self.session
            .exec(
                &format!(
                    "UPDATE {}.instances SET mysql_server_uuid = ? WHERE address = ?",
                    METADATA_SCHEMA
                ),
                &[SqlValue::from(server_uuid), SqlValue::from(address)],
            )
            .await?;
        Ok(())
    }

    async fn update_instance_attribute(
        &mut self,
        address: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), MetadataError> {
        check_attribute_key(key)?;
        if !self.instance_exists(address).await? {
            return Err(MetadataError::InstanceNotFound(address.to_string()));
        }
        let json = serde_json::to_string(value)
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        // Merge, never replace: unrelated attributes must be preserved.
        self.session
            .exec(
                &format!(
                    "UPDATE {}.instances SET attributes = \
                     JSON_SET(COALESCE(attributes, '{{}}'), '$.\"{}\"', CAST(? AS JSON)) \
                     WHERE address = ?",
                    METADATA_SCHEMA, key
                ),
                &[SqlValue::from(json), SqlValue::from(address)],
            )
            .await?;
        Ok(())
    }

    async fn remove_instance_attribute(
        &mut self,
        address: &str,
        key: &str,
    ) -> Result<(), MetadataError> {
        check_attribute_key(key)?;
        if !self.instance_exists(address).await? {
            return Err(MetadataError::InstanceNotFound(address.to_string()));
        }
        self.session
            .exec(
                &format!(
                    "UPDATE {}.instances SET attributes = \
                     JSON_REMOVE(attributes, '$.\"{}\"') WHERE address = ?",
                    METADATA_SCHEMA, key
                ),
                &[SqlValue::from(address)],
            )
            .await?;
        Ok(())
    }

    async fn routers(&mut self) -> Result<Vec<RouterRecord>, MetadataError> {
        let version = self.version().await?;
        let rows = if is_legacy(&version) {
            // Pre-2.0 keeps router host info in a separate `hosts` table.
            self.session
                .query(
                    &format!(
                        "SELECT r.router_id, r.router_name, h.host_name AS address, \
                         r.attributes FROM {schema}.routers r \
                         JOIN {schema}.hosts h ON r.host_id = h.host_id",
                        schema = METADATA_SCHEMA
                    ),
                    &[],
                )
                .await?
        } else {
            self.session
                .query(
                    &format!(
                        "SELECT router_id, router_name, address, version, last_check_in, \
                         attributes FROM {}.routers",
                        METADATA_SCHEMA
                    ),
                    &[],
                )
                .await?
        };

        let mut routers = Vec::with_capacity(rows.len());
        for row in &rows {
            let attributes = parse_json_column(row, "attributes")?;
            // The legacy layout stores the version inside attributes.
            let version = row.str_opt("version").or_else(|| {
                attributes
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            routers.push(RouterRecord {
                router_id: row.req_u64("router_id")?,
                label: row.str_opt("router_name").unwrap_or_default(),
                hostname: row.req_str("address")?,
                version,
                last_check_in: row.str_opt("last_check_in"),
                attributes,
            });
        }
        Ok(routers)
    }

    #[instrument(skip(self))]
    async fn remove_router(&mut self, router_id: u64) -> Result<(), MetadataError> {
        let row = self
            .session
            .query_one(
                &format!(
                    "SELECT COUNT(*) AS n FROM {}.routers WHERE router_id = ?",
                    METADATA_SCHEMA
                ),
                &[SqlValue::Int(router_id as i64)],
            )
            .await?;
        if row.and_then(|r| r.i64_opt("n")).unwrap_or(0) == 0 {
            return Err(MetadataError::RouterNotFound(router_id.to_string()));
        }
        self.session
            .exec(
                &format!("DELETE FROM {}.routers WHERE router_id = ?", METADATA_SCHEMA),
                &[SqlValue::Int(router_id as i64)],
            )
            .await?;
        Ok(())
    }

    async fn drop_cluster(&mut self) -> Result<(), MetadataError> {
        self.session
            .exec(&format!("DELETE FROM {}.instances", METADATA_SCHEMA), &[])
            .await?;
        self.session
            .exec(&format!("DELETE FROM {}.clusters", METADATA_SCHEMA), &[])
            .await?;
        Ok(())
    }
}
