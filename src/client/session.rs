//! Session abstraction over a MySQL connection.
//!
//! Controllers talk to servers only through [`SqlSession`] and
//! [`SessionFactory`] so tests can substitute scripted sessions. Rows come
//! back as loosely typed [`SqlRow`] values with case-insensitive column
//! access, matching how server tables mix upper and lower case column names.

use async_trait::async_trait;
use thiserror::Error;

use crate::client::types::InstanceAddress;

/// Client-side code for an unreachable host.
pub const CR_CONN_HOST_ERROR: u16 = 2003;
/// Client-side code for a connection lost mid-session.
pub const CR_SERVER_LOST: u16 = 2013;

/// Errors surfaced by a session or while establishing one.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The server could not be reached at all.
    #[error("Can't connect to MySQL server on '{address}' ({code}): {message}")]
    Connect {
        address: String,
        code: u16,
        message: String,
    },

    /// An established connection dropped.
    #[error("Lost connection to MySQL server at '{address}' ({code}): {message}")]
    Lost {
        address: String,
        code: u16,
        message: String,
    },

    /// The server rejected a statement.
    #[error("MySQL Error {code}: {message}")]
    Server { code: u16, message: String },

    /// A driver-level failure that is neither a server error nor an IO drop.
    #[error("{0}")]
    Driver(String),

    /// A result row did not have the expected shape.
    #[error("Malformed result: {0}")]
    Malformed(String),
}

impl SessionError {
    /// The MySQL error code, when one applies.
    pub fn native_code(&self) -> Option<u16> {
        match self {
            SessionError::Connect { code, .. }
            | SessionError::Lost { code, .. }
            | SessionError::Server { code, .. } => Some(*code),
            SessionError::Driver(_) | SessionError::Malformed(_) => None,
        }
    }

    /// Whether the failure is about reaching the server rather than about
    /// what was asked of it. Connectivity failures are retryable.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SessionError::Connect { .. } | SessionError::Lost { .. }
        )
    }
}

/// A single result value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::UInt(u) => i64::try_from(*u).ok(),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::UInt(u) => Some(*u),
            SqlValue::Int(i) => u64::try_from(*i).ok(),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Double(d) => Some(*d),
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::UInt(u) => Some(*u as f64),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(i) => write!(f, "{}", i),
            SqlValue::UInt(u) => write!(f, "{}", u),
            SqlValue::Double(d) => write!(f, "{}", d),
            SqlValue::Text(s) => write!(f, "{}", s),
            SqlValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Int(i)
    }
}

impl From<u64> for SqlValue {
    fn from(u: u64) -> Self {
        SqlValue::UInt(u)
    }
}

impl From<f64> for SqlValue {
    fn from(d: f64) -> Self {
        SqlValue::Double(d)
    }
}

/// A result row with case-insensitive column lookup.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(pairs: Vec<(&str, SqlValue)>) -> Self {
        let (columns, values) = pairs
            .into_iter()
            .map(|(c, v)| (c.to_string(), v))
            .unzip();
        Self { columns, values }
    }

    pub fn from_parts(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| &self.values[i])
    }

    pub fn str_opt(&self, column: &str) -> Option<String> {
        self.get(column)
            .and_then(SqlValue::as_str)
            .map(str::to_string)
    }

    pub fn i64_opt(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn f64_opt(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }

    pub fn req_str(&self, column: &str) -> Result<String, SessionError> {
        self.str_opt(column)
            .ok_or_else(|| SessionError::Malformed(format!("missing text column '{}'", column)))
    }

    pub fn req_u64(&self, column: &str) -> Result<u64, SessionError> {
        self.get(column)
            .and_then(SqlValue::as_u64)
            .ok_or_else(|| SessionError::Malformed(format!("missing numeric column '{}'", column)))
    }
}

/// A live connection to one server.
#[async_trait]
pub trait SqlSession: Send {
    /// Run a statement and collect its result rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue])
    -> Result<Vec<SqlRow>, SessionError>;

    /// Run a statement, discarding any result.
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), SessionError>;

    /// Run a statement expected to yield at most one row.
    async fn query_one(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlRow>, SessionError> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }
}

/// Opens sessions against arbitrary instances.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, address: &InstanceAddress)
    -> Result<Box<dyn SqlSession>, SessionError>;
}
