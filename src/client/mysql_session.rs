//! Classic-protocol session over the `mysql_async` driver.
//!
//! This is the only module that touches the driver; everything above it
//! goes through the [`SqlSession`] seam. Connectivity failures map to the
//! native client codes (2003 on connect, 2013 once connected) so callers
//! can surface them verbatim.

use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Row, Value};
use tracing::{debug, instrument};

use crate::client::session::{
    CR_CONN_HOST_ERROR, CR_SERVER_LOST, SessionError, SessionFactory, SqlRow, SqlSession,
    SqlValue,
};
use crate::client::types::InstanceAddress;

/// Connection settings shared by every session the factory opens.
#[derive(Clone, Debug)]
pub struct MySqlSessionConfig {
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl Default for MySqlSessionConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl MySqlSessionConfig {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// [`SessionFactory`] producing `mysql_async` backed sessions.
pub struct MySqlSessionFactory {
    config: MySqlSessionConfig,
}

impl MySqlSessionFactory {
    pub fn new(config: MySqlSessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for MySqlSessionFactory {
    #[instrument(skip(self), fields(address = %address))]
    async fn connect(
        &self,
        address: &InstanceAddress,
    ) -> Result<Box<dyn SqlSession>, SessionError> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(address.host())
            .tcp_port(address.port())
            .user(Some(self.config.user.clone()))
            .pass(Some(self.config.password.clone()))
            .prefer_socket(false)
            .into();

        let conn = tokio::time::timeout(self.config.connect_timeout, Conn::new(opts))
            .await
            .map_err(|_| SessionError::Connect {
                address: address.to_string(),
                code: CR_CONN_HOST_ERROR,
                message: format!(
                    "connection attempt timed out after {:?}",
                    self.config.connect_timeout
                ),
            })?
            .map_err(|e| connect_error(address, e))?;

        debug!("Session established");
        Ok(Box::new(MySqlSession {
            address: address.clone(),
            conn,
        }))
    }
}

struct MySqlSession {
    address: InstanceAddress,
    conn: Conn,
}

#[async_trait]
impl SqlSession for MySqlSession {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SessionError> {
        let rows: Vec<Row> = if params.is_empty() {
            // Text protocol: some admin statements cannot be prepared.
            self.conn
                .query(sql)
                .await
                .map_err(|e| session_error(&self.address, e))?
        } else {
            self.conn
                .exec(sql, to_params(params))
                .await
                .map_err(|e| session_error(&self.address, e))?
        };
        Ok(rows.into_iter().map(to_sql_row).collect())
    }

    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), SessionError> {
        if params.is_empty() {
            self.conn
                .query_drop(sql)
                .await
                .map_err(|e| session_error(&self.address, e))
        } else {
            self.conn
                .exec_drop(sql, to_params(params))
                .await
                .map_err(|e| session_error(&self.address, e))
        }
    }
}

fn to_params(params: &[SqlValue]) -> Params {
    Params::Positional(params.iter().map(to_driver_value).collect())
}

fn to_driver_value(v: &SqlValue) -> Value {
    match v {
        SqlValue::Null => Value::NULL,
        SqlValue::Int(i) => Value::Int(*i),
        SqlValue::UInt(u) => Value::UInt(*u),
        SqlValue::Double(d) => Value::Double(*d),
        SqlValue::Text(s) => Value::Bytes(s.clone().into_bytes()),
        SqlValue::Bytes(b) => Value::Bytes(b.clone()),
    }
}

fn from_driver_value(v: &Value) -> SqlValue {
    match v {
        Value::NULL => SqlValue::Null,
        Value::Int(i) => SqlValue::Int(*i),
        Value::UInt(u) => SqlValue::UInt(*u),
        Value::Float(f) => SqlValue::Double(f64::from(*f)),
        Value::Double(d) => SqlValue::Double(*d),
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => SqlValue::Text(s.to_string()),
            Err(_) => SqlValue::Bytes(b.clone()),
        },
        // Temporal values are not read by the engine; keep them printable.
        other => SqlValue::Text(format!("{:?}", other)),
    }
}

fn to_sql_row(row: Row) -> SqlRow {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values = (0..columns.len())
        .map(|i| row.as_ref(i).map(from_driver_value).unwrap_or(SqlValue::Null))
        .collect();
    SqlRow::from_parts(columns, values)
}

/// Map a driver error raised while connecting.
fn connect_error(address: &InstanceAddress, e: mysql_async::Error) -> SessionError {
    match e {
        mysql_async::Error::Server(server) => SessionError::Server {
            code: server.code,
            message: server.message,
        },
        mysql_async::Error::Io(io) => SessionError::Connect {
            address: address.to_string(),
            code: CR_CONN_HOST_ERROR,
            message: io.to_string(),
        },
        other => SessionError::Driver(other.to_string()),
    }
}

/// Map a driver error raised on an established session.
fn session_error(address: &InstanceAddress, e: mysql_async::Error) -> SessionError {
    match e {
        mysql_async::Error::Server(server) => SessionError::Server {
            code: server.code,
            message: server.message,
        },
        mysql_async::Error::Io(io) => SessionError::Lost {
            address: address.to_string(),
            code: CR_SERVER_LOST,
            message: io.to_string(),
        },
        other => SessionError::Driver(other.to_string()),
    }
}
