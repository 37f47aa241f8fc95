//! Topology rescan and metadata repair.
//!
//! `rescan()` diffs the live group membership against the recorded metadata
//! and repairs the differences. Planning is pure: [`plan_rescan`] computes
//! what is wrong from data alone, and the apply step decides per repair
//! class whether to act, ask, or only report.

use tracing::{debug, info, instrument};

use crate::client::probe::GroupMember;
use crate::client::types::{InstanceAddress, MemberState};
use crate::controller::address::addresses_match;
use crate::controller::error::Result;
use crate::controller::membership::Cluster;
use crate::controller::prompter::Confirmation;
use crate::metadata::types::InstanceRecord;

/// Options for `rescan`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RescanOptions {
    /// Add newly discovered members to metadata without asking.
    pub add_unmanaged: bool,
    /// Remove metadata rows for vanished members without asking.
    pub remove_obsolete: bool,
}

/// An identity drift on a managed instance.
#[derive(Debug, PartialEq)]
pub enum IdentityFix {
    /// The stored server_id no longer matches the live one.
    ServerId {
        address: String,
        stored: Option<u32>,
        live: u32,
    },
    /// The stored server UUID is blank and must be restored from the live
    /// instance.
    BlankUuid { address: String, live: String },
}

impl IdentityFix {
    pub fn address(&self) -> &str {
        match self {
            IdentityFix::ServerId { address, .. } | IdentityFix::BlankUuid { address, .. } => {
                address
            }
        }
    }
}

/// A recovery-account attribute repair.
#[derive(Debug, PartialEq)]
pub struct AccountFix {
    pub address: String,
    pub user: String,
    pub host: String,
}

/// Everything a rescan found, before anything is changed.
#[derive(Debug, Default)]
pub struct RescanPlan {
    /// Group members without a metadata row.
    pub unmanaged: Vec<GroupMember>,
    /// Metadata rows without a group member.
    pub obsolete: Vec<String>,
    pub identity_fixes: Vec<IdentityFix>,
    pub account_fixes: Vec<AccountFix>,
    /// Invalidated former primaries, reported but never touched.
    pub skipped_invalidated: Vec<String>,
}

impl RescanPlan {
    pub fn is_empty(&self) -> bool {
        self.unmanaged.is_empty()
            && self.obsolete.is_empty()
            && self.identity_fixes.is_empty()
            && self.account_fixes.is_empty()
    }
}

/// Input per managed instance for identity and account checks. Taken from a
/// live probe; `None` when the instance could not be probed.
#[derive(Debug, Clone)]
pub struct LiveIdentity {
    pub server_uuid: String,
    pub server_id: u32,
    /// The user the managed replication channel authenticates with.
    pub channel_user: Option<String>,
}

/// Diff the live membership against the recorded metadata.
///
/// `live` maps each record address to its probed identity, where reachable.
/// `allowed_host` and `account_prefix` come from the cluster configuration
/// and drive recovery-account derivation.
pub fn plan_rescan(
    records: &[InstanceRecord],
    members: &[GroupMember],
    live: &[(String, Option<LiveIdentity>)],
    allowed_host: &str,
    account_prefix: &str,
) -> RescanPlan {
    let mut plan = RescanPlan::default();

    for member in members {
        if member.state == MemberState::Missing {
            continue;
        }
        let known = records.iter().any(|r| {
            r.server_uuid == member.server_uuid
                || r.address
                    .parse::<InstanceAddress>()
                    .is_ok_and(|a| addresses_match(&a, &member.address))
        });
        if !known {
            plan.unmanaged.push(member.clone());
        }
    }

    for record in records {
        if record.is_invalidated() {
            plan.skipped_invalidated.push(record.address.clone());
            continue;
        }
        let present = members.iter().any(|m| {
            m.server_uuid == record.server_uuid
                || record
                    .address
                    .parse::<InstanceAddress>()
                    .is_ok_and(|a| addresses_match(&a, &m.address))
        });
        if !present {
            plan.obsolete.push(record.address.clone());
            continue;
        }

        let Some(identity) = live
            .iter()
            .find(|(address, _)| address == &record.address)
            .and_then(|(_, identity)| identity.as_ref())
        else {
            continue;
        };

        if record.server_uuid.is_empty() {
            plan.identity_fixes.push(IdentityFix::BlankUuid {
                address: record.address.clone(),
                live: identity.server_uuid.clone(),
            });
        }
        if record.server_id() != Some(identity.server_id) {
            plan.identity_fixes.push(IdentityFix::ServerId {
                address: record.address.clone(),
                stored: record.server_id(),
                live: identity.server_id,
            });
        }

        if record.recovery_account().is_none() {
            let user = identity
                .channel_user
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| format!("{}{}", account_prefix, identity.server_id));
            plan.account_fixes.push(AccountFix {
                address: record.address.clone(),
                user,
                host: allowed_host.to_string(),
            });
        }
    }

    plan
}

impl Cluster {
    /// Reconcile metadata with the live topology.
    #[instrument(skip(self, options))]
    pub async fn rescan(&mut self, options: RescanOptions) -> Result<()> {
        self.ensure_usable()?;

        let members = self.context.topology.members(&self.primary).await?;
        let records = self.context.metadata.instances().await?;
        let channel = self.managed_channel_name();

        let mut live = Vec::with_capacity(records.len());
        for record in &records {
            let identity = match record.address.parse::<InstanceAddress>() {
                Ok(address) => self.probe_if_reachable(&address).await?.map(|snap| {
                    LiveIdentity {
                        server_uuid: snap.server_uuid.clone(),
                        server_id: snap.server_id,
                        channel_user: snap
                            .managed_channel(channel)
                            .map(|c| c.user.clone())
                            .filter(|u| !u.is_empty()),
                    }
                }),
                Err(_) => None,
            };
            live.push((record.address.clone(), identity));
        }

        let plan = plan_rescan(
            &records,
            &members,
            &live,
            &self.record.replication_allowed_host(),
            self.record.cluster_type.recovery_account_prefix(),
        );

        for address in &plan.skipped_invalidated {
            self.context.console.info(&format!(
                "NOTE: The instance '{}' is invalidated and was ignored.",
                address
            ));
        }
        if plan.is_empty() {
            self.context
                .console
                .info("No changes detected between the metadata and the live topology.");
            return Ok(());
        }

        self.apply_unmanaged(&plan, options).await?;
        self.apply_obsolete(&plan, options, &records).await?;
        self.apply_identity_fixes(&plan).await?;
        self.apply_account_fixes(&plan).await?;

        info!("Rescan finished");
        Ok(())
    }

    async fn apply_unmanaged(&mut self, plan: &RescanPlan, options: RescanOptions) -> Result<()> {
        for member in &plan.unmanaged {
            let add = if options.add_unmanaged {
                true
            } else if self.context.interactive {
                self.context
                    .prompter
                    .confirm(
                        &format!(
                            "The instance '{}' is part of the replication topology but is \
                             not managed. Add it to the metadata?",
                            member.address
                        ),
                        true,
                    )
                    .await
                    == Confirmation::Yes
            } else {
                self.context.console.warning(&format!(
                    "WARNING: The instance '{}' is part of the replication topology but \
                     is not in the metadata. Use addUnmanaged to register it.",
                    member.address
                ));
                false
            };
            if !add {
                continue;
            }
            let snapshot = self.context.topology.probe(&member.address).await?;
            let mut record = InstanceRecord {
                server_uuid: snapshot.server_uuid.clone(),
                address: member.address.to_string(),
                label: member.address.to_string(),
                addresses: crate::metadata::types::InstanceAddresses {
                    mysql_classic: member.address.to_string(),
                    mysql_x: None,
                    gr_local: None,
                },
                attributes: serde_json::Map::new(),
            };
            record.set_server_id(snapshot.server_id);
            if let Some(user) = snapshot
                .managed_channel(self.managed_channel_name())
                .map(|c| c.user.clone())
                .filter(|u| !u.is_empty())
            {
                record.set_recovery_account(&user, &self.record.replication_allowed_host());
            }
            self.context.metadata.insert_instance(&record).await?;
            self.context.console.info(&format!(
                "The instance '{}' was added to the metadata.",
                member.address
            ));
        }
        Ok(())
    }

    async fn apply_obsolete(
        &mut self,
        plan: &RescanPlan,
        options: RescanOptions,
        records: &[InstanceRecord],
    ) -> Result<()> {
        if plan.obsolete.is_empty() {
            return Ok(());
        }

        let remove = if options.remove_obsolete {
            true
        } else if self.context.interactive {
            // One combined question for all vanished rows.
            self.context
                .prompter
                .confirm(
                    &format!(
                        "The following instances are no longer part of the replication \
                         topology: {}. Remove them from the metadata?",
                        plan.obsolete.join(", ")
                    ),
                    true,
                )
                .await
                == Confirmation::Yes
        } else {
            self.context.console.warning(&format!(
                "WARNING: The following instances are in the metadata but no longer part \
                 of the replication topology: {}. Use removeObsolete to remove them.",
                plan.obsolete.join(", ")
            ));
            false
        };
        if !remove {
            return Ok(());
        }

        for address in &plan.obsolete {
            self.context.metadata.remove_instance(address).await?;
            self.context.console.info(&format!(
                "The instance '{}' was removed from the metadata.",
                address
            ));

            let removed_own_row = records
                .iter()
                .find(|r| &r.address == address)
                .is_some_and(|r| r.server_uuid == self.session_uuid);
            if removed_own_row {
                // The row backing this handle's session is gone; the handle
                // cannot be trusted anymore.
                self.dissolved = true;
                self.context.console.warning(
                    "WARNING: The instance this session is connected to was removed \
                     from the metadata. The cluster object is no longer usable.",
                );
            }
        }
        Ok(())
    }

    async fn apply_identity_fixes(&mut self, plan: &RescanPlan) -> Result<()> {
        for fix in &plan.identity_fixes {
            match fix {
                IdentityFix::ServerId { address, live, .. } => {
                    self.context
                        .metadata
                        .update_instance_attribute(
                            address,
                            crate::metadata::types::ATTR_SERVER_ID,
                            &serde_json::Value::from(*live),
                        )
                        .await?;
                    debug!(address = %address, server_id = live, "Repaired stored server_id");
                }
                IdentityFix::BlankUuid { address, live } => {
                    self.context
                        .metadata
                        .update_instance_uuid(address, live)
                        .await?;
                    debug!(address = %address, "Restored blank server UUID");
                }
            }
        }
        Ok(())
    }

    async fn apply_account_fixes(&mut self, plan: &RescanPlan) -> Result<()> {
        for fix in &plan.account_fixes {
            self.context
                .metadata
                .update_instance_attribute(
                    &fix.address,
                    crate::metadata::types::ATTR_RECOVERY_ACCOUNT_USER,
                    &serde_json::Value::from(fix.user.as_str()),
                )
                .await?;
            self.context
                .metadata
                .update_instance_attribute(
                    &fix.address,
                    crate::metadata::types::ATTR_RECOVERY_ACCOUNT_HOST,
                    &serde_json::Value::from(fix.host.as_str()),
                )
                .await?;
            debug!(address = %fix.address, user = %fix.user, "Repaired recovery account attributes");
        }
        Ok(())
    }
}
