//! Server-side administrative statements.
//!
//! [`ServerOps`] is the write seam to managed servers: account management,
//! system variables, clone provisioning and replication channel control.
//! The real implementation, [`SqlServerOps`], opens one session per call
//! through a [`SessionFactory`] and issues the actual SQL; tests replace
//! the trait to observe and simulate these effects.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::client::session::{SessionError, SessionFactory, SqlValue};
use crate::client::types::InstanceAddress;
use crate::controller::repl_options::ReplicationOptions;

/// Administrative writes against a single server.
#[async_trait]
pub trait ServerOps: Send + Sync {
    /// Create a replication recovery account with a never-expiring password
    /// (`password_lifetime=0`).
    async fn create_recovery_account(
        &self,
        at: &InstanceAddress,
        user: &str,
        allowed_host: &str,
        password: &str,
    ) -> Result<(), SessionError>;

    /// Drop an account, ignoring a missing one.
    async fn drop_account(
        &self,
        at: &InstanceAddress,
        user: &str,
        host: &str,
    ) -> Result<(), SessionError>;

    /// Set a global system variable, persisting it when the server supports
    /// `SET PERSIST`.
    async fn set_sysvar(
        &self,
        at: &InstanceAddress,
        name: &str,
        value: &str,
        persist: bool,
    ) -> Result<(), SessionError>;

    /// Read a global system variable.
    async fn get_sysvar(
        &self,
        at: &InstanceAddress,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    /// Provision the target from the donor with a remote clone. The target
    /// restarts itself when the clone finishes.
    ///
    /// Not named `clone_from` because `Arc<dyn ServerOps>` would resolve
    /// that to the inherent `Clone::clone_from` instead of this method.
    async fn clone_instance(
        &self,
        target: &InstanceAddress,
        donor: &InstanceAddress,
        user: &str,
        password: &str,
    ) -> Result<(), SessionError>;

    /// Configure (or reconfigure) the managed replication channel.
    async fn configure_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
        source: &InstanceAddress,
        user: &str,
        password: &str,
        options: &ReplicationOptions,
    ) -> Result<(), SessionError>;

    async fn start_channel(&self, at: &InstanceAddress, channel: &str)
        -> Result<(), SessionError>;

    async fn stop_channel(&self, at: &InstanceAddress, channel: &str)
        -> Result<(), SessionError>;

    /// Tear the channel down completely (`RESET REPLICA ALL`), required when
    /// a configured channel parameter must become unconfigured.
    async fn reset_channel(&self, at: &InstanceAddress, channel: &str)
        -> Result<(), SessionError>;

    /// Make the given member the group's primary.
    async fn set_as_primary(
        &self,
        via: &InstanceAddress,
        member_uuid: &str,
    ) -> Result<(), SessionError>;

    /// Stop group replication on the instance (used when removing it).
    async fn stop_group_replication(&self, at: &InstanceAddress) -> Result<(), SessionError>;

    /// The users all replication channels on this instance authenticate
    /// with. Used for recovery-account in-use checks during removal.
    async fn channel_users(&self, at: &InstanceAddress) -> Result<Vec<String>, SessionError>;
}

/// Quote a string literal for embedding in statements that do not accept
/// placeholders (account management, channel configuration).
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

/// Reject system variable names that are not plain identifiers.
fn check_sysvar_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(SessionError::Malformed(format!(
            "invalid system variable name '{}'",
            name
        )));
    }
    Ok(())
}

/// SQL-issuing [`ServerOps`] implementation.
pub struct SqlServerOps<F: SessionFactory> {
    factory: F,
}

impl<F: SessionFactory> SqlServerOps<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F: SessionFactory> ServerOps for SqlServerOps<F> {
    #[instrument(skip(self, password), fields(at = %at, user = user))]
    async fn create_recovery_account(
        &self,
        at: &InstanceAddress,
        user: &str,
        allowed_host: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(at).await?;
        let account = format!("{}@{}", quote(user), quote(allowed_host));
        session
            .exec(
                &format!(
                    "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {} PASSWORD EXPIRE NEVER",
                    account,
                    quote(password)
                ),
                &[],
            )
            .await?;
        session
            .exec(
                &format!(
                    "GRANT REPLICATION SLAVE, BACKUP_ADMIN, CLONE_ADMIN ON *.* TO {}",
                    account
                ),
                &[],
            )
            .await?;
        debug!("Recovery account created");
        Ok(())
    }

    #[instrument(skip(self), fields(at = %at, user = user, host = host))]
    async fn drop_account(
        &self,
        at: &InstanceAddress,
        user: &str,
        host: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(at).await?;
        session
            .exec(
                &format!("DROP USER IF EXISTS {}@{}", quote(user), quote(host)),
                &[],
            )
            .await
    }

    #[instrument(skip(self), fields(at = %at, name = name, value = value))]
    async fn set_sysvar(
        &self,
        at: &InstanceAddress,
        name: &str,
        value: &str,
        persist: bool,
    ) -> Result<(), SessionError> {
        check_sysvar_name(name)?;
        let mut session = self.factory.connect(at).await?;
        let scope = if persist { "PERSIST" } else { "GLOBAL" };
        // SET statements are not preparable, so the value is inlined as a
        // quoted literal; the server coerces it for numeric variables.
        session
            .exec(&format!("SET {} {} = {}", scope, name, quote(value)), &[])
            .await
    }

    async fn get_sysvar(
        &self,
        at: &InstanceAddress,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        check_sysvar_name(name)?;
        let mut session = self.factory.connect(at).await?;
        let row = session
            .query_one(&format!("SELECT @@global.{} AS value", name), &[])
            .await?;
        Ok(row.and_then(|r| r.get("value").map(|v| v.to_string())))
    }

    #[instrument(skip(self, password), fields(target = %target, donor = %donor))]
    async fn clone_instance(
        &self,
        target: &InstanceAddress,
        donor: &InstanceAddress,
        user: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(target).await?;
        session
            .exec(
                &format!(
                    "SET GLOBAL clone_valid_donor_list = {}",
                    quote(&donor.to_string())
                ),
                &[],
            )
            .await?;
        info!("Starting remote clone; the instance will restart when it completes");
        session
            .exec(
                &format!(
                    "CLONE INSTANCE FROM {}@{}:{} IDENTIFIED BY {}",
                    quote(user),
                    quote(donor.host()),
                    donor.port(),
                    quote(password)
                ),
                &[],
            )
            .await
    }

    #[instrument(skip(self, password), fields(at = %at, channel = channel, source = %source))]
    async fn configure_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
        source: &InstanceAddress,
        user: &str,
        password: &str,
        options: &ReplicationOptions,
    ) -> Result<(), SessionError> {
        let mut stmt = format!(
            "CHANGE REPLICATION SOURCE TO SOURCE_HOST = {}, SOURCE_PORT = {}, \
             SOURCE_USER = {}, SOURCE_PASSWORD = {}, SOURCE_AUTO_POSITION = 1, \
             SOURCE_SSL = 1",
            quote(source.host()),
            source.port(),
            quote(user),
            quote(password)
        );
        if let Some(v) = options.connect_retry {
            stmt.push_str(&format!(", SOURCE_CONNECT_RETRY = {}", v));
        }
        if let Some(v) = options.retry_count {
            stmt.push_str(&format!(", SOURCE_RETRY_COUNT = {}", v));
        }
        if let Some(v) = options.heartbeat_period {
            stmt.push_str(&format!(", SOURCE_HEARTBEAT_PERIOD = {}", v));
        }
        if let Some(v) = &options.compression_algorithms {
            stmt.push_str(&format!(", SOURCE_COMPRESSION_ALGORITHMS = {}", quote(v)));
        }
        if let Some(v) = options.zstd_compression_level {
            stmt.push_str(&format!(", SOURCE_ZSTD_COMPRESSION_LEVEL = {}", v));
        }
        if let Some(v) = &options.bind {
            stmt.push_str(&format!(", SOURCE_BIND = {}", quote(v)));
        }
        if let Some(v) = &options.network_namespace {
            stmt.push_str(&format!(", NETWORK_NAMESPACE = {}", quote(v)));
        }
        stmt.push_str(&format!(" FOR CHANNEL {}", quote(channel)));

        let mut session = self.factory.connect(at).await?;
        session.exec(&stmt, &[]).await
    }

    async fn start_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(at).await?;
        session
            .exec(&format!("START REPLICA FOR CHANNEL {}", quote(channel)), &[])
            .await
    }

    async fn stop_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(at).await?;
        session
            .exec(&format!("STOP REPLICA FOR CHANNEL {}", quote(channel)), &[])
            .await
    }

    async fn reset_channel(
        &self,
        at: &InstanceAddress,
        channel: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(at).await?;
        session
            .exec(
                &format!("STOP REPLICA FOR CHANNEL {}", quote(channel)),
                &[],
            )
            .await?;
        session
            .exec(
                &format!("RESET REPLICA ALL FOR CHANNEL {}", quote(channel)),
                &[],
            )
            .await
    }

    #[instrument(skip(self), fields(via = %via, member = member_uuid))]
    async fn set_as_primary(
        &self,
        via: &InstanceAddress,
        member_uuid: &str,
    ) -> Result<(), SessionError> {
        let mut session = self.factory.connect(via).await?;
        session
            .exec(
                "SELECT group_replication_set_as_primary(?)",
                &[SqlValue::from(member_uuid)],
            )
            .await
    }

    async fn stop_group_replication(&self, at: &InstanceAddress) -> Result<(), SessionError> {
        let mut session = self.factory.connect(at).await?;
        session.exec("STOP GROUP_REPLICATION", &[]).await
    }

    async fn channel_users(&self, at: &InstanceAddress) -> Result<Vec<String>, SessionError> {
        let mut session = self.factory.connect(at).await?;
        let rows = session
            .query(
                "SELECT USER FROM performance_schema.replication_connection_configuration",
                &[],
            )
            .await?;
        Ok(rows.iter().filter_map(|r| r.str_opt("USER")).collect())
    }
}
