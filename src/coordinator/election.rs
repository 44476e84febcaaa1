//! Primary election and topology mode
//!
//! `setPrimaryInstance`, `switchToMultiPrimaryMode`,
//! `switchToSinglePrimaryMode` and `forceQuorumUsingPartitionOf`.

use crate::common::{validate_address, AuditEventType, Deadline, Error, Result};
use crate::coordinator::cluster::ClusterContext;
use crate::coordinator::options::SetPrimaryInstanceOptions;
use crate::coordinator::report::{OperationReport, SPLIT_BRAIN_WARNING};
use crate::coordinator::{Cluster, ClusterView};
use crate::metadata::{cluster_lock, HeldLocks, MetadataTxn};
use crate::topology::model::SINGLE_PRIMARY_AUTO_INCREMENT;
use crate::topology::{
    MemberClassification, MemberState, Statement, TopologyMode, CLUSTERSET_CHANNEL,
};
use std::time::Duration;

impl Cluster {
    /// Reject the handover when a member runs an asynchronous channel the
    /// orchestrator does not manage.
    fn check_uncontrolled_channels(view: &ClusterView) -> Result<()> {
        for probe in view.probes.iter().filter_map(|p| p.result()) {
            if let Some(channel) = probe
                .channels
                .iter()
                .find(|c| c.channel != CLUSTERSET_CHANNEL)
            {
                return Err(Error::InvalidState(format!(
                    "{} runs replication channel '{}' which is not managed by the cluster; stop it before changing the primary",
                    probe.address, channel.channel
                )));
            }
        }
        Ok(())
    }

    /// Every registered member must be reachable and ONLINE
    fn require_all_online(view: &ClusterView) -> Result<()> {
        view.require_quorum()?;
        let offline: Vec<&str> = view
            .health
            .members
            .iter()
            .filter(|m| m.registered)
            .filter(|m| !(m.reachable && m.state == MemberClassification::Online))
            .map(|m| m.address.as_str())
            .collect();
        if !offline.is_empty() {
            return Err(Error::InvalidState(format!(
                "all members of cluster '{}' must be ONLINE; not ONLINE: {}",
                view.name(),
                offline.join(", ")
            )));
        }
        Ok(())
    }

    // === setPrimaryInstance ===

    pub async fn set_primary_instance(
        &self,
        address: &str,
        opts: SetPrimaryInstanceOptions,
    ) -> Result<OperationReport> {
        validate_address(address)?;
        opts.validate()?;

        let ctx = self.context(true).await?;
        ctx.view.require_quorum()?;
        if ctx.view.health.multi_primary != Some(false) {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is not in single-primary mode",
                self.name
            )));
        }
        if ctx.view.registered(address).is_none() {
            return Err(Error::InvalidState(format!(
                "{} is not a member of cluster '{}'",
                address, self.name
            )));
        }
        let target = ctx
            .view
            .probe(address)
            .ok_or_else(|| Error::unreachable(address, "target instance is not reachable"))?;
        let online = ctx
            .view
            .health
            .member(address)
            .map(|m| m.in_view && m.state == MemberClassification::Online)
            .unwrap_or(false);
        if !online {
            return Err(Error::InvalidState(format!(
                "{} is not ONLINE in cluster '{}'",
                address, self.name
            )));
        }
        Self::check_uncontrolled_channels(&ctx.view)?;

        let mut report = OperationReport::new("setPrimaryInstance");
        let current = ctx.view.require_available()?;
        if current == address {
            report.info(format!("{} is already the primary of the cluster", address));
            return Ok(report);
        }
        let target_uuid = target.server_uuid.clone();

        let locks = self.lock_on(&current, &ctx.view.record).await?;
        let result = self
            .set_primary_instance_locked(&ctx, &current, address, &target_uuid, &opts, report)
            .await;
        locks.release().await;
        result
    }

    async fn set_primary_instance_locked(
        &self,
        ctx: &ClusterContext,
        current: &str,
        address: &str,
        target_uuid: &str,
        opts: &SetPrimaryInstanceOptions,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let view = self.orch.reprobe(&ctx.view).await;
        view.require_quorum()?;
        let deadline = self.orch.deadline();

        if let Some(secs) = opts.running_transactions_timeout {
            let primary_gtid = view
                .probe(current)
                .map(|p| p.gtid_executed.clone())
                .unwrap_or_default();
            let drain = deadline.min(Duration::from_secs(u64::from(secs)));
            self.orch
                .wait_for_member("the target to apply pending transactions", address, drain, |r| {
                    r.gtid_executed.contains(&primary_gtid)
                })
                .await?;
        }

        let instance = self.orch.connect(current).await?;
        let res = instance
            .execute(Statement::SetAsPrimary {
                member_id: target_uuid.to_string(),
                running_transactions_timeout: opts.running_transactions_timeout,
            })
            .await;
        instance.close().await;
        res?;
        report.action(format!("elect {} as the group primary", address));

        let view = self
            .orch
            .wait_for_cluster("the new primary to take over", &view, deadline, |v| {
                v.primary() == Some(address)
            })
            .await?;

        self.follow_primary_change(ctx, &view, current, address, &mut report)
            .await?;

        let writer = self.metadata_writer(ctx.snapshot(), &view).await?;
        let mut record = view.record.clone();
        record.primary_instance = Some(address.to_string());
        let mut txn = MetadataTxn::new();
        txn.put_cluster(&record)?;
        self.orch.commit_metadata(&writer, txn).await?;

        report.info(format!(
            "{} was switched from PRIMARY to SECONDARY.",
            current
        ));
        report.info(format!("{} was switched from SECONDARY to PRIMARY.", address));
        self.orch.audit().log_event(
            AuditEventType::PrimaryChanged,
            "orchestrator",
            Some(self.name.clone()),
            format!("primary moved from {} to {}", current, address),
            None,
        );
        Ok(report)
    }

    /// Keep ClusterSet replication attached to the cluster's new primary
    async fn follow_primary_change(
        &self,
        ctx: &ClusterContext,
        view: &ClusterView,
        old: &str,
        new: &str,
        report: &mut OperationReport,
    ) -> Result<()> {
        let Some(set) = ctx.clusterset() else {
            return Ok(());
        };
        if set.primary_cluster == view.record.cluster_id {
            // Replica clusters follow the global primary
            self.orch
                .redirect_replica_clusters(ctx.snapshot(), set, &[], new, report)
                .await
        } else if ctx.is_active_replica() {
            let source = self.metadata_writer(ctx.snapshot(), view).await?;
            self.move_clusterset_channel(Some(old), new, &source, report)
                .await
        } else {
            Ok(())
        }
    }

    // === switchToMultiPrimaryMode ===

    pub async fn switch_to_multi_primary_mode(&self) -> Result<OperationReport> {
        let ctx = self.context(true).await?;
        if ctx.clusterset().is_some() {
            return Err(Error::InvalidState(format!(
                "cluster '{}' belongs to a ClusterSet, which requires single-primary mode",
                self.name
            )));
        }
        Self::require_all_online(&ctx.view)?;

        let mut report = OperationReport::new("switchToMultiPrimaryMode");
        if ctx.view.health.multi_primary == Some(true) {
            for address in ctx.view.online() {
                report.info(format!("{} remains PRIMARY.", address));
            }
            if ctx.view.record.topology_mode != TopologyMode::MultiPrimary {
                let locks = self.lock_on(&ctx.view.require_available()?, &ctx.view.record).await?;
                let result = self.commit_mode(&ctx.view, TopologyMode::MultiPrimary, None).await;
                locks.release().await;
                result?;
                report.action("record Multi-Primary mode in metadata".to_string());
            }
            return Ok(report);
        }

        let primary = ctx.view.require_available()?;
        let locks = self.lock_on(&primary, &ctx.view.record).await?;
        let result = self.switch_to_multi_primary_locked(&ctx, &primary, report).await;
        locks.release().await;
        result
    }

    async fn switch_to_multi_primary_locked(
        &self,
        ctx: &ClusterContext,
        primary: &str,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let view = self.orch.reprobe(&ctx.view).await;
        Self::require_all_online(&view)?;

        let instance = self.orch.connect(primary).await?;
        let res = instance.execute(Statement::SwitchToMultiPrimary).await;
        instance.close().await;
        res?;
        report.action("switch the group to multi-primary mode".to_string());

        let members = view.online();
        let view = self
            .orch
            .wait_for_cluster("every member to become PRIMARY", &view, self.orch.deadline(), |v| {
                v.health.multi_primary == Some(true)
                    && members.iter().all(|a| {
                        v.probe(a)
                            .map(|p| p.multi_primary && p.state == MemberState::Online)
                            .unwrap_or(false)
                    })
            })
            .await?;
        self.apply_auto_increment(&view, &mut report).await?;

        self.commit_mode(&view, TopologyMode::MultiPrimary, None).await?;
        for address in &members {
            if address == primary {
                report.info(format!("{} remains PRIMARY.", address));
            } else {
                report.info(format!("{} was switched from SECONDARY to PRIMARY.", address));
            }
        }
        self.orch.audit().log_event(
            AuditEventType::TopologyModeChanged,
            "orchestrator",
            Some(self.name.clone()),
            "switched to multi-primary mode",
            None,
        );
        Ok(report)
    }

    // === switchToSinglePrimaryMode ===

    pub async fn switch_to_single_primary_mode(
        &self,
        address: Option<&str>,
    ) -> Result<OperationReport> {
        if let Some(address) = address {
            validate_address(address)?;
        }
        let ctx = self.context(true).await?;
        Self::require_all_online(&ctx.view)?;
        if let Some(address) = address {
            if ctx.view.registered(address).is_none() {
                return Err(Error::InvalidState(format!(
                    "{} is not a member of cluster '{}'",
                    address, self.name
                )));
            }
        }

        let mut report = OperationReport::new("switchToSinglePrimaryMode");
        if ctx.view.health.multi_primary == Some(false) {
            let primary = ctx.view.require_available()?;
            for member in ctx.view.online() {
                if member == primary {
                    report.info(format!("{} remains PRIMARY.", member));
                } else {
                    report.info(format!("{} remains SECONDARY.", member));
                }
            }
            if let Some(address) = address.filter(|a| *a != primary) {
                report.warn(format!(
                    "the cluster is already in single-primary mode; use setPrimaryInstance to make {} the primary",
                    address
                ));
            }
            if ctx.view.record.topology_mode != TopologyMode::SinglePrimary {
                let locks = self.lock_on(&primary, &ctx.view.record).await?;
                let result = self
                    .commit_mode(&ctx.view, TopologyMode::SinglePrimary, Some(&primary))
                    .await;
                locks.release().await;
                result?;
                report.action("record Single-Primary mode in metadata".to_string());
            }
            return Ok(report);
        }

        let entry = ctx.view.require_available()?;
        let member_id = match address {
            Some(address) => Some(
                ctx.view
                    .probe(address)
                    .map(|p| p.server_uuid.clone())
                    .ok_or_else(|| Error::unreachable(address, "target instance is not reachable"))?,
            ),
            None => None,
        };
        let locks = self.lock_on(&entry, &ctx.view.record).await?;
        let result = self
            .switch_to_single_primary_locked(&ctx, &entry, address, member_id, report)
            .await;
        locks.release().await;
        result
    }

    async fn switch_to_single_primary_locked(
        &self,
        ctx: &ClusterContext,
        entry: &str,
        address: Option<&str>,
        member_id: Option<String>,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let view = self.orch.reprobe(&ctx.view).await;
        Self::require_all_online(&view)?;

        let instance = self.orch.connect(entry).await?;
        let res = instance
            .execute(Statement::SwitchToSinglePrimary { member_id })
            .await;
        instance.close().await;
        res?;
        report.action("switch the group to single-primary mode".to_string());

        let members = view.online();
        let view = self
            .orch
            .wait_for_cluster("a single primary to be elected", &view, self.orch.deadline(), |v| {
                v.health.multi_primary == Some(false)
                    && v.primary().is_some()
                    && address.map(|a| v.primary() == Some(a)).unwrap_or(true)
            })
            .await?;
        let primary = view.require_available()?;

        for member in &members {
            let instance = self.orch.connect(member).await?;
            let res = instance.set_auto_increment(SINGLE_PRIMARY_AUTO_INCREMENT).await;
            instance.close().await;
            res?;
        }
        report.action(format!(
            "restore auto_increment_increment={} auto_increment_offset={} on every member",
            SINGLE_PRIMARY_AUTO_INCREMENT.0, SINGLE_PRIMARY_AUTO_INCREMENT.1
        ));

        self.commit_mode(&view, TopologyMode::SinglePrimary, Some(&primary))
            .await?;
        for member in &members {
            if *member == primary {
                report.info(format!("{} remains PRIMARY.", member));
            } else {
                report.info(format!("{} was switched from PRIMARY to SECONDARY.", member));
            }
        }
        self.orch.audit().log_event(
            AuditEventType::TopologyModeChanged,
            "orchestrator",
            Some(self.name.clone()),
            format!("switched to single-primary mode, primary {}", primary),
            None,
        );
        Ok(report)
    }

    async fn commit_mode(
        &self,
        view: &ClusterView,
        mode: TopologyMode,
        primary: Option<&str>,
    ) -> Result<()> {
        let writer = view.require_available()?;
        let mut record = view.record.clone();
        record.topology_mode = mode;
        record.primary_instance = primary.map(String::from);
        let mut txn = MetadataTxn::new();
        txn.put_cluster(&record)?;
        self.orch.commit_metadata(&writer, txn).await
    }

    // === forceQuorumUsingPartitionOf ===

    /// Re-form the group from the partition `address` belongs to. Members
    /// outside that partition must be rejoined explicitly afterwards.
    pub async fn force_quorum_using_partition_of(&self, address: &str) -> Result<OperationReport> {
        validate_address(address)?;

        let ctx = self.context(true).await?;
        if ctx.view.health.quorum {
            return Err(Error::InvalidState(format!(
                "cluster '{}' has quorum; forceQuorumUsingPartitionOf is only allowed when quorum is lost",
                self.name
            )));
        }
        if ctx.view.registered(address).is_none() {
            return Err(Error::InvalidState(format!(
                "{} is not a member of cluster '{}'",
                address, self.name
            )));
        }
        let anchor = ctx
            .view
            .probe(address)
            .ok_or_else(|| Error::unreachable(address, "instance is not reachable"))?
            .clone();
        if anchor.state != MemberState::Online
            || anchor.group_name.as_deref() != Some(ctx.view.record.group_name.as_str())
        {
            return Err(Error::InvalidState(format!(
                "{} is {} and not part of the group of cluster '{}'",
                address, anchor.state, self.name
            )));
        }

        // Members of the anchor's view that answer and agree with it
        let mut partition: Vec<String> = anchor
            .members
            .iter()
            .filter(|row| row.state == MemberState::Online)
            .filter(|row| {
                ctx.view
                    .probe(&row.address)
                    .map(|p| {
                        p.state == MemberState::Online
                            && p.group_name == anchor.group_name
                            && p.view_id == anchor.view_id
                    })
                    .unwrap_or(false)
            })
            .map(|row| row.address.clone())
            .collect();
        partition.sort();
        if !partition.iter().any(|a| a == address) {
            partition.push(address.to_string());
        }

        let instance = self.orch.connect(address).await?;
        let mut locks = HeldLocks::new();
        if let Err(e) = self
            .orch
            .lock(
                &mut locks,
                &instance,
                &[(cluster_lock(&ctx.view.record.cluster_id), true)],
            )
            .await
        {
            locks.release().await;
            instance.close().await;
            return Err(e);
        }
        let result = self
            .force_quorum_locked(&ctx, &instance, &partition)
            .await;
        locks.release().await;
        instance.close().await;
        result
    }

    async fn force_quorum_locked(
        &self,
        ctx: &ClusterContext,
        anchor: &crate::topology::Instance,
        partition: &[String],
    ) -> Result<OperationReport> {
        let mut report = OperationReport::new("forceQuorumUsingPartitionOf");
        report.warn(SPLIT_BRAIN_WARNING);

        anchor
            .execute(Statement::ForceMembers {
                addresses: partition.to_vec(),
            })
            .await?;
        report.action(format!(
            "restore quorum using the partition {}",
            partition.join(", ")
        ));

        let deadline: Deadline = self.orch.deadline();
        let view = self
            .orch
            .wait_for_cluster("quorum to be restored", &ctx.view, deadline, |v| {
                v.health.quorum && v.primary().is_some()
            })
            .await?;

        let excluded: Vec<String> = view
            .instances
            .iter()
            .filter(|i| !partition.contains(&i.address))
            .map(|i| i.address.clone())
            .collect();
        if !excluded.is_empty() {
            report.warn(format!(
                "{} are no longer part of the group; rejoin them with rejoinInstance or remove them with removeInstance",
                excluded.join(", ")
            ));
        }

        if view.record.topology_mode == TopologyMode::SinglePrimary {
            let primary = view.primary().map(String::from);
            if primary != view.record.primary_instance {
                let mut record = view.record.clone();
                record.primary_instance = primary;
                let mut txn = MetadataTxn::new();
                txn.put_cluster(&record)?;
                match self.metadata_writer(ctx.snapshot(), &view).await {
                    Ok(writer) => {
                        self.orch.commit_metadata(&writer, txn).await?;
                        report.action("record the new primary in metadata".to_string());
                    }
                    Err(e) => report.warn(format!(
                        "the primary pointer in metadata could not be updated ({}); run rescan later",
                        e
                    )),
                }
            }
        }

        report.info(format!(
            "Restored quorum of cluster '{}' using the partition of {}.",
            self.name,
            anchor.address()
        ));
        self.orch.audit().log_event(
            AuditEventType::QuorumForced,
            "orchestrator",
            Some(self.name.clone()),
            format!("quorum forced using {}; {}", partition.join(", "), SPLIT_BRAIN_WARNING),
            None,
        );
        Ok(report)
    }
}
