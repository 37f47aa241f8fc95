//! Membership operations.
//!
//! The [`Cluster`] handle is the entry point for everything that changes
//! which servers belong to the managed topology: adding, removing and
//! rejoining instances, primary switchover, per-instance options, and
//! dissolving the whole cluster. Each operation contacts one server at a
//! time, validates before mutating, and writes metadata as its last step so
//! a failure part-way never leaves a row for work that did not happen.

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::probe::{
    MemberRole, wait_for_gtid_sync, wait_for_member_online, wait_for_restart,
};
use crate::client::types::{
    GtidComparison, InstanceAddress, InstanceSnapshot, MemberState,
};
use crate::controller::address::resolve_instance;
use crate::controller::capabilities::InstanceCapabilities;
use crate::controller::context::ClusterContext;
use crate::controller::error::{Error, Result};
use crate::controller::recovery::{
    self, ArbiterInput, RecoveryMethod, RecoveryRequest,
};
use crate::controller::repl_options::{self, ChannelUpdate, ReplicationOptions};
use crate::controller::router::RouterCompatTable;
use crate::metadata::types::{
    ATTR_GTID_SET_IS_COMPLETE, ATTR_INVALIDATED, ATTR_REPLICATION_ALLOWED_HOST, ClusterRecord,
    ClusterType, InstanceAddresses, InstanceRecord, TopologyMode,
};

/// The replication channel managed for group members.
pub const GROUP_RECOVERY_CHANNEL: &str = "group_replication_recovery";
/// The managed channel for async replica sets (the default channel).
pub const ASYNC_CHANNEL: &str = "";

/// Auto-increment settings for one member.
///
/// Single-primary clusters stagger primaries from potential standbys with a
/// fixed offset; multi-primary clusters spread members over a modulus of 7
/// so concurrently generated keys cannot collide.
pub fn auto_increment_settings(mode: TopologyMode, server_id: u32) -> (u32, u32) {
    match mode {
        TopologyMode::SinglePrimary => (1, 2),
        TopologyMode::MultiPrimary => (7, 1 + server_id % 7),
    }
}

/// Options for `addInstance`.
#[derive(Debug, Default)]
pub struct AddInstanceOptions {
    pub recovery_method: RecoveryRequest,
    pub label: Option<String>,
    pub replication_options: ReplicationOptions,
}

/// Options for `removeInstance`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveInstanceOptions {
    pub force: bool,
}

/// Options for `createCluster`.
#[derive(Debug)]
pub struct CreateClusterOptions {
    pub cluster_type: ClusterType,
    pub multi_primary: bool,
    pub gtid_set_is_complete: bool,
    pub replication_allowed_host: Option<String>,
}

impl Default for CreateClusterOptions {
    fn default() -> Self {
        Self {
            cluster_type: ClusterType::GroupReplication,
            multi_primary: false,
            gtid_set_is_complete: false,
            replication_allowed_host: None,
        }
    }
}

/// Per-instance slice of `status()`.
#[derive(Debug)]
pub struct InstanceStatus {
    pub address: String,
    pub label: String,
    pub member_state: MemberState,
    /// Non-fatal findings, e.g. replication option drift.
    pub instance_errors: Vec<String>,
}

/// Result of `status()`.
#[derive(Debug)]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub topology_mode: TopologyMode,
    pub primary: String,
    pub instances: Vec<InstanceStatus>,
}

/// Declared and live option values for one instance, side by side.
#[derive(Debug)]
pub struct InstanceOptions {
    pub address: String,
    pub declared: ReplicationOptions,
    /// `None` when the instance is unreachable or has no managed channel.
    pub live: Option<ReplicationOptions>,
}

/// A connected cluster handle.
pub struct Cluster {
    pub(crate) context: ClusterContext,
    pub(crate) record: ClusterRecord,
    /// The member the handle's operations are routed through.
    pub(crate) primary: InstanceAddress,
    /// UUID of the instance whose session this handle uses. If a rescan
    /// removes that row the handle must be invalidated.
    pub(crate) session_uuid: String,
    pub(crate) router_compat: RouterCompatTable,
    pub(crate) dissolved: bool,
}

impl Cluster {
    /// Create cluster metadata seeded with the given primary.
    #[instrument(skip(context, options), fields(name = %name, primary = %primary))]
    pub async fn create(
        mut context: ClusterContext,
        name: &str,
        primary: &InstanceAddress,
        options: CreateClusterOptions,
    ) -> Result<Cluster> {
        check_cluster_name(name)?;
        context
            .console
            .info("Checking connectivity and SSL configuration...");
        let snapshot = context.topology.probe(primary).await?;

        let topology_mode = if options.multi_primary {
            TopologyMode::MultiPrimary
        } else {
            TopologyMode::SinglePrimary
        };

        let mut record = ClusterRecord {
            cluster_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            cluster_type: options.cluster_type,
            topology_mode,
            attributes: serde_json::Map::new(),
        };
        record.attributes.insert(
            ATTR_GTID_SET_IS_COMPLETE.to_string(),
            Value::Bool(options.gtid_set_is_complete),
        );
        if let Some(host) = &options.replication_allowed_host {
            record.attributes.insert(
                ATTR_REPLICATION_ALLOWED_HOST.to_string(),
                Value::from(host.as_str()),
            );
        }
        context.metadata.create_cluster(&record).await?;

        let mut seed = instance_record_from_snapshot(&snapshot, primary, None);
        let user = format!(
            "{}{}",
            record.cluster_type.recovery_account_prefix(),
            snapshot.server_id
        );
        let allowed_host = record.replication_allowed_host();
        context
            .server_ops
            .create_recovery_account(primary, &user, &allowed_host, &generate_password())
            .await?;
        seed.set_recovery_account(&user, &allowed_host);
        context.metadata.insert_instance(&seed).await?;

        let (increment, offset) =
            auto_increment_settings(record.topology_mode, snapshot.server_id);
        apply_auto_increment(&context, primary, increment, offset).await?;

        info!(cluster_id = %record.cluster_id, "Cluster metadata created");
        Ok(Cluster {
            context,
            record,
            primary: primary.clone(),
            session_uuid: snapshot.server_uuid,
            router_compat: RouterCompatTable::default(),
            dissolved: false,
        })
    }

    /// Attach to an existing cluster through the given member.
    ///
    /// Writes are routed to the group's PRIMARY, whichever member the
    /// caller happened to connect to. When the entry point cannot report a
    /// primary (it fell out of the group, or the view is empty) the handle
    /// falls back to the entry point itself.
    pub async fn connect(mut context: ClusterContext, via: &InstanceAddress) -> Result<Cluster> {
        let record = context.metadata.cluster().await?;
        let snapshot = context.topology.probe(via).await?;
        let primary = match context.topology.members(via).await {
            Ok(members) => members
                .iter()
                .find(|m| m.role == MemberRole::Primary && m.state == MemberState::Online)
                .map(|m| m.address.clone())
                .unwrap_or_else(|| via.clone()),
            Err(e) if e.is_connectivity() => via.clone(),
            Err(e) => return Err(e.into()),
        };
        Ok(Cluster {
            context,
            record,
            primary,
            session_uuid: snapshot.server_uuid,
            router_compat: RouterCompatTable::default(),
            dissolved: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Override the router compatibility table used by `listRouters`.
    pub fn set_router_compat(&mut self, table: RouterCompatTable) {
        self.router_compat = table;
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.dissolved {
            return Err(Error::Dissolved);
        }
        Ok(())
    }

    pub(crate) fn managed_channel_name(&self) -> &'static str {
        match self.record.cluster_type {
            ClusterType::GroupReplication => GROUP_RECOVERY_CHANNEL,
            ClusterType::AsyncReplication => ASYNC_CHANNEL,
        }
    }

    /// Add an instance to the cluster.
    #[instrument(skip(self, options), fields(address = %address))]
    pub async fn add_instance(
        &mut self,
        address: &InstanceAddress,
        options: AddInstanceOptions,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.context
            .console
            .info("Checking connectivity and SSL configuration...");
        let target = self.context.topology.probe(address).await?;

        let records = self.context.metadata.instances().await?;
        if resolve_instance(&records, address, Some(&target)).is_some() {
            return Err(Error::Argument(format!(
                "The instance '{}' is already part of the cluster '{}'",
                address, self.record.name
            )));
        }
        if records.iter().any(|r| {
            r.server_id().is_some_and(|id| id == target.server_id)
        }) {
            return Err(Error::Argument(format!(
                "The instance '{}' has a server_id ({}) that is already used by another \
                 member of the cluster",
                address, target.server_id
            )));
        }

        let donor = self.context.topology.probe(&self.primary).await?;
        let comparison = GtidComparison::classify(
            &target.gtid_executed,
            &donor.gtid_executed,
            &donor.gtid_purged,
        );
        let decision = recovery::decide(
            ArbiterInput {
                requested: options.recovery_method,
                comparison,
                capabilities: InstanceCapabilities::from_version(&target.version),
                gtid_set_is_complete: self.record.gtid_set_is_complete(),
                interactive: self.context.interactive,
            },
            self.context.prompter.as_ref(),
        )
        .await?;
        for note in &decision.notes {
            self.context.console.info(&format!("NOTE: {}", note));
        }

        let user = self.recovery_user(target.server_id);
        let allowed_host = self.record.replication_allowed_host();
        let password = generate_password();
        self.context
            .server_ops
            .create_recovery_account(&self.primary, &user, &allowed_host, &password)
            .await?;

        let provisioned = self
            .provision(
                address,
                decision.method,
                &user,
                &password,
                &options.replication_options,
            )
            .await;
        match provisioned {
            Ok(()) => {}
            Err(Error::Timeout { operation, seconds }) => {
                // The account is deliberately kept: the clone finished on the
                // target side and the instance will need it once it comes
                // back. The operator completes the join with rescan().
                self.context.console.warning(&format!(
                    "WARNING: The instance '{}' did not come back within {}s. It may \
                     still be joining. Please call rescan() once it is back online.",
                    address, seconds
                ));
                return Err(Error::Timeout { operation, seconds });
            }
            Err(e) => {
                // No orphaned accounts on failure.
                if let Err(drop_err) = self
                    .context
                    .server_ops
                    .drop_account(&self.primary, &user, &allowed_host)
                    .await
                {
                    warn!(error = %drop_err, "Failed to drop recovery account during rollback");
                }
                return Err(e);
            }
        }

        let mut record =
            instance_record_from_snapshot(&target, address, options.label.as_deref());
        record.set_recovery_account(&user, &allowed_host);
        for name in repl_options::OPTION_NAMES {
            // Unset options report as null; only explicit values become rows.
            if let Some(value) = options
                .replication_options
                .get_by_name(name)
                .filter(|v| !v.is_null())
                && let Some(key) = ReplicationOptions::attribute_key(name)
            {
                record.attributes.insert(key.to_string(), value);
            }
        }
        self.context.metadata.insert_instance(&record).await?;

        self.refresh_auto_increment().await?;
        info!(address = %address, "Instance added to cluster");
        Ok(())
    }

    async fn provision(
        &mut self,
        address: &InstanceAddress,
        method: RecoveryMethod,
        user: &str,
        password: &str,
        declared: &ReplicationOptions,
    ) -> Result<()> {
        match method {
            RecoveryMethod::Clone => {
                self.context
                    .console
                    .info(&format!("Clone based state recovery is now in progress for '{}'", address));
                self.context
                    .server_ops
                    .clone_instance(address, &self.primary, user, password)
                    .await?;
                // The server restarts itself when the clone finishes.
                wait_for_restart(
                    self.context.topology.as_ref(),
                    address,
                    self.context.restart_wait_timeout,
                )
                .await?;
            }
            RecoveryMethod::Incremental => {
                self.context
                    .console
                    .info(&format!("Incremental state recovery is now in progress for '{}'", address));
                let channel = self.managed_channel_name();
                self.context
                    .server_ops
                    .configure_channel(address, channel, &self.primary, user, password, declared)
                    .await?;
                self.context.server_ops.start_channel(address, channel).await?;
                let donor = self.context.topology.probe(&self.primary).await?;
                wait_for_gtid_sync(
                    self.context.topology.as_ref(),
                    address,
                    &donor.gtid_executed,
                    self.context.gtid_wait_timeout,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Remove an instance from the cluster.
    #[instrument(skip(self, options), fields(address = %address))]
    pub async fn remove_instance(
        &mut self,
        address: &InstanceAddress,
        options: RemoveInstanceOptions,
    ) -> Result<()> {
        self.ensure_usable()?;
        let snapshot = self.probe_if_reachable(address).await?;

        let records = self.context.metadata.instances().await?;
        let record = resolve_instance(&records, address, snapshot.as_ref())
            .ok_or_else(|| {
                Error::Metadata(format!(
                    "The instance '{}' does not belong to the cluster '{}'",
                    address, self.record.name
                ))
            })?
            .clone();

        match &snapshot {
            None => {
                if !options.force {
                    return Err(Error::Argument(format!(
                        "The instance '{}' is not reachable. To remove it from the \
                         cluster metadata anyway, use the 'force' option",
                        address
                    )));
                }
                self.context.console.warning(&format!(
                    "WARNING: The instance '{}' was removed from the metadata only. If \
                     it is brought back online it may try to rejoin the cluster.",
                    record.address
                ));
            }
            Some(snap) if snap.member_state == MemberState::Online => {
                let donor = self.context.topology.probe(&self.primary).await?;
                let synced = wait_for_gtid_sync(
                    self.context.topology.as_ref(),
                    &snap.address,
                    &donor.gtid_executed,
                    self.context.gtid_wait_timeout,
                )
                .await;
                match synced {
                    Ok(()) => {}
                    Err(e) if options.force => {
                        self.context.console.warning(&format!(
                            "WARNING: Transaction sync failed but the instance will be \
                             removed anyway: {}",
                            e
                        ));
                    }
                    Err(e) => return Err(e.into()),
                }
                self.context
                    .server_ops
                    .stop_group_replication(&snap.address)
                    .await?;
            }
            Some(snap) => {
                if !options.force && !self.confirm_remove_not_online(address, snap).await? {
                    return Err(Error::Cancelled("Cancelled".to_string()));
                }
                self.context
                    .server_ops
                    .stop_group_replication(&snap.address)
                    .await
                    .ok();
            }
        }

        self.cleanup_recovery_account(&record, &records).await?;

        // Metadata write is the last step. The message reports the stored
        // address, which may differ from the spelling the caller used.
        self.context.metadata.remove_instance(&record.address).await?;
        self.refresh_auto_increment().await?;
        self.context.console.info(&format!(
            "The instance '{}' was successfully removed from the cluster.",
            record.address
        ));
        info!(address = %record.address, "Instance removed from cluster");
        Ok(())
    }

    async fn confirm_remove_not_online(
        &self,
        address: &InstanceAddress,
        snapshot: &InstanceSnapshot,
    ) -> Result<bool> {
        if !self.context.interactive {
            return Err(Error::Argument(format!(
                "The instance '{}' is {}, not ONLINE. Use the 'force' option to \
                 remove it anyway",
                address, snapshot.member_state
            )));
        }
        let answer = self
            .context
            .prompter
            .confirm(
                &format!(
                    "The instance '{}' is {}. Remove it from the cluster anyway?",
                    address, snapshot.member_state
                ),
                false,
            )
            .await;
        Ok(answer == crate::controller::prompter::Confirmation::Yes)
    }

    /// Drop the removed instance's recovery account from the primary unless
    /// another member's channel still authenticates with it.
    async fn cleanup_recovery_account(
        &mut self,
        removed: &InstanceRecord,
        records: &[InstanceRecord],
    ) -> Result<()> {
        let Some((user, host)) = removed.recovery_account() else {
            return Ok(());
        };

        for other in records {
            if other.server_uuid == removed.server_uuid {
                continue;
            }
            let Ok(address) = other.address.parse::<InstanceAddress>() else {
                continue;
            };
            match self.context.server_ops.channel_users(&address).await {
                Ok(users) if users.iter().any(|u| u == &user) => {
                    self.context.console.info(&format!(
                        "NOTE: The recovery account '{}' is still in use by '{}' and \
                         will not be dropped.",
                        user, other.address
                    ));
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.is_connectivity() => {
                    // Cannot prove it is unused, so keep it.
                    debug!(address = %other.address, error = %e,
                        "Member unreachable during account-in-use check, keeping account");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.context
            .server_ops
            .drop_account(&self.primary, &user, &host)
            .await?;
        debug!(user = %user, "Recovery account dropped");
        Ok(())
    }

    /// Bring a member that fell out of the group back in, reconciling its
    /// replication channel with the declared options.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn rejoin_instance(&mut self, address: &InstanceAddress) -> Result<()> {
        self.ensure_usable()?;
        let target = self.context.topology.probe(address).await?;
        let records = self.context.metadata.instances().await?;
        let record = resolve_instance(&records, address, Some(&target))
            .ok_or_else(|| {
                Error::Metadata(format!(
                    "The instance '{}' does not belong to the cluster '{}'",
                    address, self.record.name
                ))
            })?
            .clone();

        let donor = self.context.topology.probe(&self.primary).await?;
        let comparison = GtidComparison::classify(
            &target.gtid_executed,
            &donor.gtid_executed,
            &donor.gtid_purged,
        );
        if comparison.has_errant() {
            return Err(Error::GtidIncompatible(format!(
                "The instance '{}' contains errant transactions that did not originate \
                 from the cluster",
                address
            )));
        }

        let channel = self.managed_channel_name();
        let declared = record.replication_options();
        let live = target
            .managed_channel(channel)
            .map(|c| c.options.clone())
            .unwrap_or_default();

        let update = repl_options::required_update(&declared, &live);
        if update != ChannelUpdate::None {
            let (user, host) = match record.recovery_account() {
                Some(account) => account,
                None => {
                    let user = self.recovery_user(
                        record.server_id().unwrap_or(target.server_id),
                    );
                    (user, self.record.replication_allowed_host())
                }
            };
            // Recovery credentials are reset so the channel can be
            // reconfigured with a known password.
            let password = generate_password();
            self.context
                .server_ops
                .drop_account(&self.primary, &user, &host)
                .await?;
            self.context
                .server_ops
                .create_recovery_account(&self.primary, &user, &host, &password)
                .await?;

            if update == ChannelUpdate::Reset {
                self.context.server_ops.reset_channel(address, channel).await?;
            } else {
                self.context.server_ops.stop_channel(address, channel).await?;
            }
            self.context
                .server_ops
                .configure_channel(address, channel, &self.primary, &user, &password, &declared)
                .await?;
        }

        self.context.server_ops.start_channel(address, channel).await?;
        wait_for_member_online(
            self.context.topology.as_ref(),
            address,
            self.context.gtid_wait_timeout,
        )
        .await?;
        info!(address = %address, "Instance rejoined the cluster");
        Ok(())
    }

    /// Promote a member to primary through the current primary.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn set_primary_instance(&mut self, address: &InstanceAddress) -> Result<()> {
        self.ensure_usable()?;
        let target = self.context.topology.probe(address).await?;
        if target.member_state != MemberState::Online {
            return Err(Error::Argument(format!(
                "The instance '{}' is {}, only ONLINE members can become primary",
                address, target.member_state
            )));
        }
        let old_primary = self.primary.clone();
        self.context
            .server_ops
            .set_as_primary(&self.primary, &target.server_uuid)
            .await?;
        self.primary = address.clone();
        self.reapply_demoted_options(&old_primary).await?;
        info!(new_primary = %address, "Primary switched");
        Ok(())
    }

    /// Promote a member when the current primary is unreachable. Does not
    /// contact the old primary; its metadata row is marked invalidated so a
    /// later rescan treats it as a split-brain survivor, not a member.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn force_primary_instance(&mut self, address: &InstanceAddress) -> Result<()> {
        self.ensure_usable()?;
        let target = self.context.topology.probe(address).await?;
        let old_primary = self.primary.clone();

        self.context
            .server_ops
            .set_as_primary(address, &target.server_uuid)
            .await?;

        let records = self.context.metadata.instances().await?;
        if let Some(old) = resolve_instance(&records, &old_primary, None) {
            self.context
                .metadata
                .update_instance_attribute(&old.address, ATTR_INVALIDATED, &Value::Bool(true))
                .await?;
            self.context.console.warning(&format!(
                "WARNING: The former primary '{}' was invalidated. It must not be \
                 brought back without being rejoined through rejoinInstance().",
                old.address
            ));
        }
        self.primary = address.clone();
        info!(new_primary = %address, "Primary switch forced");
        Ok(())
    }

    /// Re-apply declared replication options to a demoted former primary,
    /// which is now a replica. Options follow the role.
    async fn reapply_demoted_options(&mut self, demoted: &InstanceAddress) -> Result<()> {
        let records = self.context.metadata.instances().await?;
        let Some(record) = resolve_instance(&records, demoted, None) else {
            return Ok(());
        };
        let declared = record.replication_options();
        if declared.is_default() {
            return Ok(());
        }
        self.context.console.info(&format!(
            "NOTE: Re-applying declared replication options to '{}'.",
            record.address
        ));
        let record = record.clone();
        self.rejoin_instance(&record.address.parse()?).await
    }

    /// Store a cluster-wide option.
    ///
    /// Takes effect for future operations; existing members are not touched.
    #[instrument(skip(self, value), fields(option = %name))]
    pub async fn set_option(&mut self, name: &str, value: &Value) -> Result<()> {
        self.ensure_usable()?;
        let key = match name {
            "replicationAllowedHost" => ATTR_REPLICATION_ALLOWED_HOST,
            "gtidSetIsComplete" => ATTR_GTID_SET_IS_COMPLETE,
            _ => {
                return Err(Error::Argument(format!(
                    "Unknown cluster option '{}'",
                    name
                )));
            }
        };
        self.context
            .metadata
            .update_cluster_attribute(key, value)
            .await?;
        self.record.attributes.insert(key.to_string(), value.clone());
        info!(option = name, "Cluster option updated");
        Ok(())
    }

    /// Stage or store a per-instance option.
    ///
    /// The metadata is written immediately; live channels are never touched
    /// here. A replica whose channel differs only picks the change up at the
    /// next `rejoinInstance()`, and a primary only once it is demoted.
    #[instrument(skip(self, value), fields(address = %address, option = %name))]
    pub async fn set_instance_option(
        &mut self,
        address: &InstanceAddress,
        name: &str,
        value: Option<&Value>,
    ) -> Result<()> {
        self.ensure_usable()?;
        let snapshot = self.probe_if_reachable(address).await?;
        let records = self.context.metadata.instances().await?;
        let record = resolve_instance(&records, address, snapshot.as_ref())
            .ok_or_else(|| {
                Error::Metadata(format!(
                    "The instance '{}' does not belong to the cluster '{}'",
                    address, self.record.name
                ))
            })?
            .clone();

        if name == "label" {
            let label = value.and_then(Value::as_str).ok_or_else(|| {
                Error::Argument("Option 'label' requires a string value".to_string())
            })?;
            self.context
                .metadata
                .update_instance_label(&record.address, label)
                .await?;
            return Ok(());
        }

        let key = ReplicationOptions::attribute_key(name).ok_or_else(|| {
            Error::Argument(format!("Unknown instance option '{}'", name))
        })?;
        let mut staged = record.replication_options();
        if !staged.set_by_name(name, value.filter(|v| !v.is_null())) {
            return Err(Error::Argument(format!(
                "Invalid value for option '{}'",
                name
            )));
        }

        match value.filter(|v| !v.is_null()) {
            Some(v) => {
                self.context
                    .metadata
                    .update_instance_attribute(&record.address, key, v)
                    .await?;
            }
            None => {
                self.context
                    .metadata
                    .remove_instance_attribute(&record.address, key)
                    .await?;
            }
        }

        if self.is_primary(&record, snapshot.as_ref()) {
            self.context.console.info(&format!(
                "NOTE: The option will not affect '{}' while it is the primary.",
                record.address
            ));
        } else if let Some(snap) = &snapshot {
            let live = snap
                .managed_channel(self.managed_channel_name())
                .map(|c| c.options.clone())
                .unwrap_or_default();
            if repl_options::required_update(&staged, &live) != ChannelUpdate::None {
                self.context.console.info(&format!(
                    "NOTE: The change won't take effect on '{}' until rejoinInstance() \
                     is called.",
                    record.address
                ));
            }
        }
        Ok(())
    }

    /// Report cluster and member state, including non-fatal findings.
    pub async fn status(&mut self) -> Result<ClusterStatus> {
        self.ensure_usable()?;
        let records = self.context.metadata.instances().await?;
        let channel = self.managed_channel_name();

        // Members are contacted one at a time, like every other operation.
        let mut instances = Vec::with_capacity(records.len());
        for record in &records {
            let Ok(address) = record.address.parse::<InstanceAddress>() else {
                continue;
            };
            let (member_state, instance_errors) = match self.context.topology.probe(&address).await
            {
                Err(e) if e.is_connectivity() => (MemberState::Unreachable, Vec::new()),
                Err(e) => return Err(e.into()),
                Ok(snap) => {
                    let live = snap
                        .managed_channel(channel)
                        .map(|c| c.options.clone())
                        .unwrap_or_default();
                    let warnings = if self.is_primary(record, Some(&snap)) {
                        Vec::new()
                    } else {
                        repl_options::drift_warnings(&record.replication_options(), &live)
                    };
                    (snap.member_state, warnings)
                }
            };
            instances.push(InstanceStatus {
                address: record.address.clone(),
                label: record.label.clone(),
                member_state,
                instance_errors,
            });
        }
        Ok(ClusterStatus {
            cluster_name: self.record.name.clone(),
            topology_mode: self.record.topology_mode,
            primary: self.primary.to_string(),
            instances,
        })
    }

    /// Report declared and live replication options side by side.
    pub async fn options(&mut self) -> Result<Vec<InstanceOptions>> {
        self.ensure_usable()?;
        let records = self.context.metadata.instances().await?;
        let channel = self.managed_channel_name();
        let mut all = Vec::with_capacity(records.len());
        for record in &records {
            let live = match record.address.parse::<InstanceAddress>() {
                Ok(address) => self
                    .probe_if_reachable(&address)
                    .await?
                    .and_then(|snap| snap.managed_channel(channel).map(|c| c.options.clone())),
                Err(_) => None,
            };
            all.push(InstanceOptions {
                address: record.address.clone(),
                declared: record.replication_options(),
                live,
            });
        }
        Ok(all)
    }

    /// Tear the cluster down: stop replication everywhere, drop recovery
    /// accounts, and remove all metadata. The handle is unusable afterwards.
    #[instrument(skip(self))]
    pub async fn dissolve(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let records = self.context.metadata.instances().await?;
        for record in &records {
            let Ok(address) = record.address.parse::<InstanceAddress>() else {
                continue;
            };
            if let Err(e) = self.context.server_ops.stop_group_replication(&address).await {
                if e.is_connectivity() {
                    self.context.console.warning(&format!(
                        "WARNING: Could not stop replication on unreachable instance '{}'.",
                        record.address
                    ));
                } else {
                    return Err(e.into());
                }
            }
            if let Some((user, host)) = record.recovery_account() {
                self.context
                    .server_ops
                    .drop_account(&self.primary, &user, &host)
                    .await
                    .ok();
            }
        }
        self.context.metadata.drop_cluster().await?;
        self.dissolved = true;
        info!(cluster = %self.record.name, "Cluster dissolved");
        Ok(())
    }

    pub(crate) fn recovery_user(&self, server_id: u32) -> String {
        format!(
            "{}{}",
            self.record.cluster_type.recovery_account_prefix(),
            server_id
        )
    }

    fn is_primary(&self, record: &InstanceRecord, snapshot: Option<&InstanceSnapshot>) -> bool {
        if let Some(snap) = snapshot {
            if snap.server_uuid == self.session_uuid && self.primary.to_string() == record.address
            {
                return true;
            }
        }
        record
            .address
            .parse::<InstanceAddress>()
            .is_ok_and(|a| crate::controller::address::addresses_match(&a, &self.primary))
    }

    /// Probe an instance, mapping connectivity failures to `None` so callers
    /// can branch on reachability. Non-connectivity errors still propagate.
    pub(crate) async fn probe_if_reachable(
        &self,
        address: &InstanceAddress,
    ) -> Result<Option<InstanceSnapshot>> {
        match self.context.topology.probe(address).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if e.is_connectivity() => {
                debug!(address = %address, error = %e, "Instance unreachable");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-apply auto-increment settings on every reachable member.
    pub(crate) async fn refresh_auto_increment(&mut self) -> Result<()> {
        let records = self.context.metadata.instances().await?;
        for record in &records {
            let Ok(address) = record.address.parse::<InstanceAddress>() else {
                continue;
            };
            let Some(server_id) = record.server_id() else {
                continue;
            };
            let (increment, offset) =
                auto_increment_settings(self.record.topology_mode, server_id);
            if let Err(e) =
                apply_auto_increment(&self.context, &address, increment, offset).await
            {
                if e.is_retryable() {
                    debug!(address = %record.address, error = %e,
                        "Skipping auto_increment update on unreachable member");
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

async fn apply_auto_increment(
    context: &ClusterContext,
    address: &InstanceAddress,
    increment: u32,
    offset: u32,
) -> Result<()> {
    context
        .server_ops
        .set_sysvar(address, "auto_increment_increment", &increment.to_string(), true)
        .await?;
    context
        .server_ops
        .set_sysvar(address, "auto_increment_offset", &offset.to_string(), true)
        .await?;
    Ok(())
}

fn instance_record_from_snapshot(
    snapshot: &InstanceSnapshot,
    address: &InstanceAddress,
    label: Option<&str>,
) -> InstanceRecord {
    let mut record = InstanceRecord {
        server_uuid: snapshot.server_uuid.clone(),
        address: address.to_string(),
        label: label.map_or_else(|| address.to_string(), str::to_string),
        addresses: InstanceAddresses {
            mysql_classic: address.to_string(),
            mysql_x: None,
            gr_local: Some(format!("{}:{}", address.host(), 33061)),
        },
        attributes: serde_json::Map::new(),
    };
    record.set_server_id(snapshot.server_id);
    record
}

fn check_cluster_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Argument(format!(
            "Invalid cluster name '{}': only alphanumeric characters, '_' and '-' \
             are allowed",
            name
        )));
    }
    Ok(())
}

fn generate_password() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}
