//! `rejoinCluster`: bring an invalidated or detached replica cluster back
//! under the global primary.

use crate::common::{validate_name, AuditEventType, Error, Result};
use crate::coordinator::options::{RebootOptions, RejoinClusterOptions};
use crate::coordinator::report::OperationReport;
use crate::coordinator::{ClusterSet, ClusterView};
use crate::metadata::{cluster_lock, clusterset_lock, HeldLocks, MetadataTxn};
use crate::topology::{
    ClusterRole, ClusterRoleRecord, ClusterSetRecord, GtidSet, TopologyMode, CLUSTERSET_CHANNEL,
};

impl ClusterSet {
    pub async fn rejoin_cluster(
        &self,
        name: &str,
        opts: RejoinClusterOptions,
    ) -> Result<OperationReport> {
        validate_name("cluster", name)?;

        let (resolved, set) = self.resolve(true).await?;
        let snapshot = &resolved.snapshot;
        let record = resolved.cluster(name)?.clone();
        if record.clusterset_id.as_deref() != Some(set.clusterset_id.as_str()) {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is not part of ClusterSet '{}'",
                name, self.domain
            )));
        }
        if record.cluster_id == set.primary_cluster {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is the PRIMARY cluster and cannot be rejoined",
                name
            )));
        }

        let primary = self.orch.cluster_view(snapshot, &set.primary_cluster).await?;
        let global = primary.require_available().map_err(|e| {
            Error::InvalidState(format!(
                "primary cluster '{}' is not available: {}",
                primary.name(),
                e
            ))
        })?;
        let global_gtid = primary
            .primary_probe()
            .map(|p| p.gtid_executed.clone())
            .unwrap_or_default();

        let mut report = OperationReport::new("rejoinCluster").with_dry_run(opts.dry_run);
        let mut view = self.orch.cluster_view(snapshot, &record.cluster_id).await?;

        // Checked on the most advanced reachable member, before any reboot
        let most_advanced = view
            .probes
            .iter()
            .filter_map(|p| p.result())
            .max_by_key(|p| p.gtid_executed.count());
        if let Some(probe) = most_advanced {
            if let Some(errant) = Self::errant(&probe.gtid_executed, &global_gtid) {
                return Err(Error::provisioning(
                    probe.address.clone(),
                    format!(
                        "cluster '{}' has transactions the ClusterSet does not have ({}); remove it with removeCluster and create it again",
                        name, errant
                    ),
                ));
            }
        }

        // A former primary that went down together with its whole group
        // comes back with group replication stopped; restart it fenced.
        let outage = !view.health.quorum
            && view.health.view_size == 0
            && view.probes.iter().any(|p| p.is_reachable());
        if outage {
            let entry = view
                .probes
                .iter()
                .find(|p| p.is_reachable())
                .map(|p| p.address().to_string())
                .unwrap_or_default();
            if opts.dry_run {
                report.action(format!(
                    "reboot cluster '{}' from complete outage through {}",
                    name, entry
                ));
            } else {
                let reboot = self
                    .orch
                    .reboot_cluster_from_complete_outage(
                        &entry,
                        Some(name),
                        RebootOptions::default(),
                    )
                    .await?;
                for action in reboot.actions {
                    report.action(action);
                }
                view = self.orch.reprobe(&view).await;
            }
        }
        if !(outage && opts.dry_run) {
            view.require_quorum()?;
        }

        let role = snapshot.role_of(&record.cluster_id).cloned();
        let invalidated = role.as_ref().map(|r| r.invalidated).unwrap_or(false);
        let channel_ok = view
            .primary_probe()
            .and_then(|p| p.channel(CLUSTERSET_CHANNEL))
            .map(|c| c.is_running() && c.source.as_deref() == Some(global.as_str()))
            .unwrap_or(false);
        if !invalidated && channel_ok {
            report.info(format!(
                "Cluster '{}' is already a healthy REPLICA of the ClusterSet; nothing to do.",
                name
            ));
            return Ok(report);
        }

        if opts.dry_run {
            report.action(format!("fence cluster '{}' with super_read_only", name));
            report.action(format!("replicate cluster '{}' from {}", name, global));
            report.action(format!("record cluster '{}' as a valid REPLICA", name));
            return Ok(report);
        }

        let target = view.require_available()?;
        let mut locks = HeldLocks::new();
        let locked = async {
            for (address, lock, exclusive) in [
                (&global, clusterset_lock(&set.clusterset_id), false),
                (&target, cluster_lock(&record.cluster_id), true),
            ] {
                let instance = self.orch.connect(address).await?;
                let res = self
                    .orch
                    .lock(&mut locks, &instance, &[(lock, exclusive)])
                    .await;
                if res.is_err() {
                    instance.close().await;
                }
                res?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = locked {
            locks.release().await;
            return Err(e);
        }
        let result = self
            .rejoin_cluster_locked(&view, &set, &global, &global_gtid, report)
            .await;
        locks.release().await;
        result
    }

    async fn rejoin_cluster_locked(
        &self,
        view: &ClusterView,
        set: &ClusterSetRecord,
        global: &str,
        global_gtid: &GtidSet,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let name = view.name().to_string();
        let view = self.orch.reprobe(view).await;
        let primary = view.require_available()?;

        let instance = self.orch.connect(&primary).await?;
        let res = async {
            instance.set_super_read_only(true).await?;
            instance.configure_clusterset_channel(global).await
        }
        .await;
        instance.close().await;
        res?;
        report.action(format!("fence {} with super_read_only", primary));
        report.action(format!("replicate cluster '{}' from {}", name, global));

        self.orch
            .wait_for_member(
                "the rejoined cluster to catch up",
                &primary,
                self.orch.deadline(),
                |r| {
                    r.gtid_executed.contains(global_gtid)
                        && r.channel(CLUSTERSET_CHANNEL)
                            .map(|c| c.is_running() && c.source.as_deref() == Some(global))
                            .unwrap_or(false)
                },
            )
            .await?;

        let mut txn = MetadataTxn::new();
        txn.put_role(&ClusterRoleRecord {
            clusterset_id: set.clusterset_id.clone(),
            cluster_id: view.record.cluster_id.clone(),
            role: ClusterRole::Replica,
            invalidated: false,
        })?;
        if view.record.topology_mode == TopologyMode::SinglePrimary
            && view.record.primary_instance.as_deref() != Some(primary.as_str())
        {
            let mut record = view.record.clone();
            record.primary_instance = Some(primary.clone());
            txn.put_cluster(&record)?;
        }
        self.orch.commit_metadata(global, txn).await?;
        report.action(format!("record cluster '{}' as a valid REPLICA", name));

        report.info(format!(
            "Cluster '{}' was rejoined to the ClusterSet as a REPLICA.",
            name
        ));
        self.orch.audit().log_event(
            AuditEventType::ClusterRejoined,
            "orchestrator",
            Some(name),
            format!("replicating from {}", global),
            None,
        );
        Ok(report)
    }
}
