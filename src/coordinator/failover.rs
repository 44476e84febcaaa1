//! ClusterSet switchover and failover
//!
//! `setPrimaryCluster` is a controlled handover: the old primary is fenced
//! with `super_read_only`, the target catches up, then replication is
//! reversed. `forcePrimaryCluster` is used when the primary cluster is
//! gone; it never contacts the old primary and marks it invalidated, so it
//! has to be brought back with `rejoinCluster`.
//!
//! Both bump the ClusterSet generation, which is how the status aggregator
//! and `rebootClusterFromCompleteOutage` recognise a superseded primary.

use crate::common::{AuditEventType, Error, Result};
use crate::coordinator::options::{FailoverOptions, SwitchoverOptions};
use crate::coordinator::report::{OperationReport, SPLIT_BRAIN_WARNING};
use crate::coordinator::{ClusterSet, ClusterView};
use crate::metadata::{MetadataSnapshot, MetadataTxn};
use crate::topology::{
    ClusterRole, ClusterRoleRecord, ClusterSetRecord, ProbeResult, CLUSTERSET_CHANNEL,
};
use std::collections::HashSet;

/// Validated input of a switchover or failover
struct Handover<'a> {
    snapshot: &'a MetadataSnapshot,
    set: ClusterSetRecord,
    target: &'a ClusterView,
    target_primary: ProbeResult,
    /// Cluster ids to invalidate
    invalidate: Vec<String>,
}

impl Handover<'_> {
    /// Metadata of the ClusterSet once `target` is primary
    fn promoted_set(&self) -> ClusterSetRecord {
        let mut set = self.set.clone();
        set.primary_cluster = self.target.record.cluster_id.clone();
        set.generation += 1;
        set
    }

    fn commit_txn(&self, old_primary_invalidated: bool) -> Result<MetadataTxn> {
        let set = self.promoted_set();
        let mut txn = MetadataTxn::new();
        txn.put_clusterset(&set)?;
        txn.put_role(&ClusterRoleRecord {
            clusterset_id: set.clusterset_id.clone(),
            cluster_id: self.target.record.cluster_id.clone(),
            role: ClusterRole::Primary,
            invalidated: false,
        })?;
        txn.put_role(&ClusterRoleRecord {
            clusterset_id: set.clusterset_id.clone(),
            cluster_id: self.set.primary_cluster.clone(),
            role: ClusterRole::Replica,
            invalidated: old_primary_invalidated,
        })?;
        for cluster_id in &self.invalidate {
            txn.put_role(&ClusterRoleRecord {
                clusterset_id: set.clusterset_id.clone(),
                cluster_id: cluster_id.clone(),
                role: ClusterRole::Replica,
                invalidated: true,
            })?;
        }
        let mut target = self.target.record.clone();
        target.primary_instance = Some(self.target_primary.address.clone());
        txn.put_cluster(&target)?;
        Ok(txn)
    }

    fn cluster_name(&self, cluster_id: &str) -> String {
        self.snapshot
            .cluster_by_id(cluster_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| cluster_id.to_string())
    }
}

fn is_invalidated(snapshot: &MetadataSnapshot, cluster_id: &str) -> bool {
    snapshot
        .role_of(cluster_id)
        .map(|r| r.invalidated)
        .unwrap_or(false)
}

impl ClusterSet {
    /// Check `invalidateReplicaClusters` against the live state of every
    /// replica other than the target. Returns the cluster ids to invalidate.
    fn check_replicas(
        snapshot: &MetadataSnapshot,
        set: &ClusterSetRecord,
        views: &[ClusterView],
        target: &ClusterView,
        listed: &[String],
    ) -> Result<Vec<String>> {
        let mut invalidate = Vec::new();
        let mut known = HashSet::new();
        for view in views {
            let id = &view.record.cluster_id;
            if *id == set.primary_cluster || *id == target.record.cluster_id {
                continue;
            }
            known.insert(view.name().to_string());
            if is_invalidated(snapshot, id) {
                continue;
            }
            let is_listed = listed.iter().any(|n| n == view.name());
            match (view.is_available(), is_listed) {
                (true, true) => {
                    return Err(Error::Argument(format!(
                        "replica cluster '{}' is available and cannot be listed in invalidateReplicaClusters",
                        view.name()
                    )))
                }
                (false, false) => {
                    return Err(Error::InvalidState(format!(
                        "replica cluster '{}' is not available ({}); list it in invalidateReplicaClusters to proceed without it",
                        view.name(),
                        view.health.status
                    )))
                }
                (false, true) => invalidate.push(id.clone()),
                (true, false) => {}
            }
        }
        if let Some(unknown) = listed.iter().find(|n| !known.contains(n.as_str())) {
            return Err(Error::Argument(format!(
                "'{}' is not a replica cluster of this ClusterSet",
                unknown
            )));
        }
        Ok(invalidate)
    }

    /// Available replicas that keep replicating after the handover
    fn remaining_replicas<'a>(
        snapshot: &MetadataSnapshot,
        set: &ClusterSetRecord,
        views: &'a [ClusterView],
        target: &ClusterView,
        invalidate: &[String],
    ) -> Vec<&'a ClusterView> {
        views
            .iter()
            .filter(|v| v.record.cluster_id != set.primary_cluster)
            .filter(|v| v.record.cluster_id != target.record.cluster_id)
            .filter(|v| !is_invalidated(snapshot, &v.record.cluster_id))
            .filter(|v| !invalidate.contains(&v.record.cluster_id))
            .filter(|v| v.is_available())
            .collect()
    }

    fn plan_report(
        handover: &Handover<'_>,
        mut report: OperationReport,
        old_primary: Option<&str>,
    ) -> OperationReport {
        let target = handover.target.name();
        let new_primary = &handover.target_primary.address;
        if let Some(old) = old_primary {
            report.action(format!("fence {} with super_read_only", old));
            report.action(format!("wait for {} to catch up with {}", new_primary, old));
        }
        report.action(format!(
            "stop the ClusterSet channel of '{}' and make {} writable",
            target, new_primary
        ));
        if let Some(old) = old_primary {
            report.action(format!("replicate {} from {}", old, new_primary));
        }
        report.action(format!("redirect the remaining replica clusters to {}", new_primary));
        for id in &handover.invalidate {
            report.action(format!("invalidate cluster '{}'", handover.cluster_name(id)));
        }
        report.action(format!("record '{}' as the PRIMARY cluster", target));
        report
    }

    // === setPrimaryCluster ===

    /// Controlled switchover to the replica cluster `name`
    pub async fn set_primary_cluster(
        &self,
        name: &str,
        opts: SwitchoverOptions,
    ) -> Result<OperationReport> {
        opts.validate(name)?;

        let (resolved, set) = self.resolve(true).await?;
        let snapshot = &resolved.snapshot;
        let target_record = resolved.cluster(name)?.clone();
        if target_record.clusterset_id.as_deref() != Some(set.clusterset_id.as_str()) {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is not part of ClusterSet '{}'",
                name, self.domain
            )));
        }
        if target_record.cluster_id == set.primary_cluster {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is already the PRIMARY cluster",
                name
            )));
        }
        if is_invalidated(snapshot, &target_record.cluster_id) {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is invalidated; rejoin it with rejoinCluster first",
                name
            )));
        }

        let views = self.views(snapshot, &set).await;
        let find = |id: &str| {
            views
                .iter()
                .find(|v| v.record.cluster_id == id)
                .ok_or_else(|| Error::MetadataCorrupted(format!("unknown cluster id {}", id)))
        };
        let old = find(set.primary_cluster.as_str())?;
        let old_primary = old.require_available().map_err(|e| {
            Error::InvalidState(format!(
                "primary cluster '{}' is not available ({}); use forcePrimaryCluster",
                old.name(),
                e
            ))
        })?;
        let target = find(target_record.cluster_id.as_str())?;
        target.require_available()?;
        let target_primary = target
            .primary_probe()
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("cluster '{}' has no primary", name)))?;

        let invalidate = Self::check_replicas(
            snapshot,
            &set,
            &views,
            target,
            &opts.invalidate_replica_clusters,
        )?;

        let global_gtid = old
            .primary_probe()
            .map(|p| p.gtid_executed.clone())
            .unwrap_or_default();
        if let Some(errant) = Self::errant(&target_primary.gtid_executed, &global_gtid) {
            return Err(Error::InvalidState(format!(
                "cluster '{}' has errant transactions ({}); it cannot be promoted",
                name, errant
            )));
        }
        for replica in Self::remaining_replicas(snapshot, &set, &views, target, &invalidate) {
            if let Some(errant) = replica
                .primary_probe()
                .and_then(|p| Self::errant(&p.gtid_executed, &global_gtid))
            {
                return Err(Error::InvalidState(format!(
                    "replica cluster '{}' has errant transactions ({}); remove it or list it in invalidateReplicaClusters",
                    replica.name(),
                    errant
                )));
            }
        }

        let handover = Handover {
            snapshot,
            set: set.clone(),
            target,
            target_primary,
            invalidate,
        };
        let report = OperationReport::new("setPrimaryCluster").with_dry_run(opts.dry_run);
        if opts.dry_run {
            return Ok(Self::plan_report(&handover, report, Some(&old_primary)));
        }

        let locks = self.lock_clusterset(&set, &views).await?;
        let result = self
            .switchover_locked(&handover, old, &old_primary, &opts, report)
            .await;
        locks.release().await;
        result
    }

    async fn switchover_locked(
        &self,
        handover: &Handover<'_>,
        old_view: &ClusterView,
        old_primary: &str,
        opts: &SwitchoverOptions,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let new_primary = handover.target_primary.address.clone();
        self.recheck_primary(old_view, old_primary).await?;
        self.recheck_primary(handover.target, &new_primary).await?;
        let deadline = self.orch.deadline();

        // 1. fence
        let old = self.orch.connect(old_primary).await?;
        let fenced = async {
            old.set_super_read_only(true).await?;
            old.member_info().await
        }
        .await;
        let old_info = match fenced {
            Ok(info) => info,
            Err(e) => {
                old.close().await;
                return Err(e);
            }
        };
        report.action(format!("fence {} with super_read_only", old_primary));

        // 2. catch up
        let sync = opts
            .timeout
            .unwrap_or_else(|| self.orch.config().sync_timeout());
        let old_gtid = old_info.gtid_executed.clone();
        let caught_up = self
            .orch
            .wait_for_member(
                "the new primary to catch up",
                &new_primary,
                deadline.min(sync),
                |r| r.gtid_executed.contains(&old_gtid),
            )
            .await;
        if let Err(e) = caught_up {
            let unfenced = old.set_super_read_only(false).await;
            old.close().await;
            if let Err(u) = unfenced {
                report.warn(format!("could not lift the fence on {}: {}", old_primary, u));
            }
            tracing::warn!("Switchover to '{}' aborted: {}", handover.target.name(), e);
            return Err(Error::Timeout(format!(
                "cluster '{}' did not catch up with {} within {:?}; the primary was unfenced",
                handover.target.name(),
                old_primary,
                sync
            )));
        }
        report.action(format!("wait for {} to catch up", new_primary));

        // 3. promote
        let target = self.orch.connect(&new_primary).await?;
        let promoted = async {
            target.remove_clusterset_channel().await?;
            target.set_super_read_only(false).await
        }
        .await;
        target.close().await;
        if let Err(e) = promoted {
            old.close().await;
            return Err(e);
        }
        report.action(format!(
            "stop the ClusterSet channel of '{}' and make {} writable",
            handover.target.name(),
            new_primary
        ));

        // 4. demote
        let demoted = old.configure_clusterset_channel(&new_primary).await;
        old.close().await;
        demoted?;
        report.action(format!("replicate {} from {}", old_primary, new_primary));

        // 5. redirect
        let promoted_set = handover.promoted_set();
        let mut skip = handover.invalidate.clone();
        skip.push(handover.set.primary_cluster.clone());
        self.orch
            .redirect_replica_clusters(
                handover.snapshot,
                &promoted_set,
                &skip,
                &new_primary,
                &mut report,
            )
            .await?;

        // 6. confirm, then commit
        let target_addr = new_primary.as_str();
        self.orch
            .wait_for_member(
                "the old primary to replicate from the new one",
                old_primary,
                deadline,
                |r| {
                    r.channel(CLUSTERSET_CHANNEL)
                        .map(|c| c.is_running() && c.source.as_deref() == Some(target_addr))
                        .unwrap_or(false)
                },
            )
            .await?;
        self.orch
            .commit_metadata(&new_primary, handover.commit_txn(false)?)
            .await?;
        report.action(format!(
            "record '{}' as the PRIMARY cluster",
            handover.target.name()
        ));

        for id in &handover.invalidate {
            let name = handover.cluster_name(id);
            report.warn(format!(
                "cluster '{}' was invalidated; use rejoinCluster to restore it",
                name
            ));
            self.orch.audit().log_event(
                AuditEventType::ClusterInvalidated,
                "orchestrator",
                Some(name),
                "invalidated during switchover",
                None,
            );
        }
        report.info(format!(
            "Cluster '{}' was promoted to PRIMARY of the ClusterSet.",
            handover.target.name()
        ));
        self.orch.audit().log_event(
            AuditEventType::Switchover,
            "orchestrator",
            Some(handover.target.name().to_string()),
            format!(
                "switchover from '{}' to '{}'",
                handover.cluster_name(&handover.set.primary_cluster),
                handover.target.name()
            ),
            Some(serde_json::json!({ "generation": handover.set.generation + 1 })),
        );
        Ok(report)
    }

    // === forcePrimaryCluster ===

    /// Failover to a replica cluster while the primary cluster is
    /// unavailable. When `name` is omitted the most up-to-date available
    /// replica is chosen.
    pub async fn force_primary_cluster(
        &self,
        name: Option<&str>,
        opts: FailoverOptions,
    ) -> Result<OperationReport> {
        opts.validate(name)?;

        let (resolved, set) = self.resolve(true).await?;
        let snapshot = &resolved.snapshot;
        let views = self.views(snapshot, &set).await;
        let old = views
            .iter()
            .find(|v| v.record.cluster_id == set.primary_cluster)
            .ok_or_else(|| {
                Error::MetadataCorrupted(format!("unknown cluster id {}", set.primary_cluster))
            })?;
        if old.is_available() {
            return Err(Error::InvalidState(format!(
                "primary cluster '{}' is available; use setPrimaryCluster for a controlled switchover",
                old.name()
            )));
        }
        if opts
            .invalidate_replica_clusters
            .iter()
            .any(|n| n == old.name())
        {
            return Err(Error::Argument(format!(
                "'{}' is the PRIMARY cluster and is invalidated by the failover itself",
                old.name()
            )));
        }

        let target = match name {
            Some(name) => {
                let view = views.iter().find(|v| v.name() == name).ok_or_else(|| {
                    Error::NotFound(format!("cluster '{}' in ClusterSet '{}'", name, self.domain))
                })?;
                if view.record.cluster_id == set.primary_cluster {
                    return Err(Error::InvalidState(format!(
                        "cluster '{}' is the current PRIMARY cluster",
                        name
                    )));
                }
                if is_invalidated(snapshot, &view.record.cluster_id) {
                    return Err(Error::InvalidState(format!(
                        "cluster '{}' is invalidated and cannot become PRIMARY",
                        name
                    )));
                }
                view.require_quorum()?;
                view.require_available()?;
                view
            }
            None => Self::select_failover_target(snapshot, &set, &views, &opts)?,
        };
        let target_primary = target
            .primary_probe()
            .cloned()
            .ok_or_else(|| {
                Error::InvalidState(format!("cluster '{}' has no primary", target.name()))
            })?;

        let invalidate = Self::check_replicas(
            snapshot,
            &set,
            &views,
            target,
            &opts.invalidate_replica_clusters,
        )?;
        for replica in Self::remaining_replicas(snapshot, &set, &views, target, &invalidate) {
            let missing = replica
                .primary_probe()
                .and_then(|p| Self::errant(&p.gtid_executed, &target_primary.gtid_executed));
            if let Some(missing) = missing {
                return Err(Error::InvalidState(format!(
                    "replica cluster '{}' has transactions missing on '{}' ({}); choose it as the target or list it in invalidateReplicaClusters",
                    replica.name(),
                    target.name(),
                    missing
                )));
            }
        }

        let handover = Handover {
            snapshot,
            set: set.clone(),
            target,
            target_primary,
            invalidate,
        };
        let mut report = OperationReport::new("forcePrimaryCluster").with_dry_run(opts.dry_run);
        report.warn(SPLIT_BRAIN_WARNING);
        if opts.dry_run {
            report.action(format!("invalidate cluster '{}'", old.name()));
            return Ok(Self::plan_report(&handover, report, None));
        }

        let locks = self.lock_clusterset(&set, &views).await?;
        let result = self.failover_locked(&handover, report).await;
        locks.release().await;
        result
    }

    /// Most up-to-date available replica; ties go to the lowest primary
    /// server uuid.
    fn select_failover_target<'a>(
        snapshot: &MetadataSnapshot,
        set: &ClusterSetRecord,
        views: &'a [ClusterView],
        opts: &FailoverOptions,
    ) -> Result<&'a ClusterView> {
        views
            .iter()
            .filter(|v| v.record.cluster_id != set.primary_cluster)
            .filter(|v| !is_invalidated(snapshot, &v.record.cluster_id))
            .filter(|v| !opts.invalidate_replica_clusters.iter().any(|n| n == v.name()))
            .filter_map(|v| v.primary_probe().map(|p| (v, p)))
            .max_by(|(_, a), (_, b)| {
                a.gtid_executed
                    .count()
                    .cmp(&b.gtid_executed.count())
                    .then_with(|| b.server_uuid.cmp(&a.server_uuid))
            })
            .map(|(v, _)| v)
            .ok_or_else(|| {
                Error::InvalidState("no available replica cluster can be promoted".to_string())
            })
    }

    async fn failover_locked(
        &self,
        handover: &Handover<'_>,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let view = self.orch.reprobe(handover.target).await;
        view.require_quorum()?;
        let new_primary = handover.target_primary.address.clone();

        let target = self.orch.connect(&new_primary).await?;
        let promoted = async {
            target.remove_clusterset_channel().await?;
            target.set_super_read_only(false).await
        }
        .await;
        target.close().await;
        promoted?;
        report.action(format!(
            "stop the ClusterSet channel of '{}' and make {} writable",
            handover.target.name(),
            new_primary
        ));

        let promoted_set = handover.promoted_set();
        let mut skip = handover.invalidate.clone();
        skip.push(handover.set.primary_cluster.clone());
        self.orch
            .redirect_replica_clusters(
                handover.snapshot,
                &promoted_set,
                &skip,
                &new_primary,
                &mut report,
            )
            .await?;

        self.orch
            .commit_metadata(&new_primary, handover.commit_txn(true)?)
            .await?;
        let old_name = handover.cluster_name(&handover.set.primary_cluster);
        report.action(format!(
            "record '{}' as the PRIMARY cluster and invalidate '{}'",
            handover.target.name(),
            old_name
        ));
        report.warn(format!(
            "former primary cluster '{}' is INVALIDATED; once it is back, rejoin it with rejoinCluster or remove it with removeCluster",
            old_name
        ));

        for id in &handover.invalidate {
            let name = handover.cluster_name(id);
            report.warn(format!(
                "cluster '{}' was invalidated; use rejoinCluster to restore it",
                name
            ));
            self.orch.audit().log_event(
                AuditEventType::ClusterInvalidated,
                "orchestrator",
                Some(name),
                "invalidated during failover",
                None,
            );
        }
        report.info(format!(
            "Cluster '{}' was forced to be the PRIMARY of the ClusterSet.",
            handover.target.name()
        ));
        self.orch.audit().log_event(
            AuditEventType::Failover,
            "orchestrator",
            Some(handover.target.name().to_string()),
            format!("failover from '{}'; {}", old_name, SPLIT_BRAIN_WARNING),
            Some(serde_json::json!({
                "generation": handover.set.generation + 1,
                "invalidated": std::iter::once(old_name.clone())
                    .chain(handover.invalidate.iter().map(|id| handover.cluster_name(id)))
                    .collect::<Vec<_>>(),
            })),
        );
        Ok(report)
    }
}
