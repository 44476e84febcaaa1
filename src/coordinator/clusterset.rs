//! ClusterSet handle, replica cluster provisioning and removal

use crate::common::{timestamp_now, validate_address, validate_name, AuditEventType, Error, Result};
use crate::coordinator::options::{RecoveryMethod, RemoveClusterOptions, ReplicaClusterOptions};
use crate::coordinator::report::OperationReport;
use crate::coordinator::{Cluster, ClusterView, Orchestrator, ResolvedMetadata};
use crate::metadata::{clusterset_lock, HeldLocks, MetadataSnapshot, MetadataStore, MetadataTxn};
use crate::topology::model::SINGLE_PRIMARY_AUTO_INCREMENT;
use crate::topology::{
    ClusterRecord, ClusterRole, ClusterRoleRecord, ClusterSetRecord, GtidSet, Instance,
    InstanceRecord, MemberState, Statement, TopologyMode, CLUSTERSET_CHANNEL,
};
use futures_util::future::join_all;

/// Handle to a ClusterSet, reached through any instance of any of its
/// clusters.
#[derive(Clone)]
pub struct ClusterSet {
    pub(crate) orch: Orchestrator,
    pub(crate) entry: String,
    pub(crate) domain: String,
}

impl std::fmt::Debug for ClusterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSet")
            .field("domain", &self.domain)
            .field("entry", &self.entry)
            .finish()
    }
}

impl ClusterSet {
    pub(crate) fn new(orch: Orchestrator, entry: &str, domain: &str) -> Self {
        Self {
            orch,
            entry: entry.to_string(),
            domain: domain.to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Handle to one member cluster, reached through the same entry
    pub fn cluster(&self, name: &str) -> Cluster {
        Cluster::new(self.orch.clone(), &self.entry, name)
    }

    /// Freshest metadata reachable from the entry, plus the set record
    pub(crate) async fn resolve(
        &self,
        for_write: bool,
    ) -> Result<(ResolvedMetadata, ClusterSetRecord)> {
        let resolved = self.orch.resolve_metadata(&self.entry).await?;
        resolved.gate(for_write)?;
        let set = resolved
            .clusterset()
            .filter(|s| s.domain == self.domain)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("ClusterSet '{}'", self.domain)))?;
        Ok((resolved, set))
    }

    /// Probe every cluster of the set concurrently; primary cluster first
    pub(crate) async fn views(
        &self,
        snapshot: &MetadataSnapshot,
        set: &ClusterSetRecord,
    ) -> Vec<ClusterView> {
        let records: Vec<ClusterRecord> = snapshot
            .clusters_in(&set.clusterset_id)
            .into_iter()
            .cloned()
            .collect();
        join_all(
            records
                .iter()
                .map(|c| self.orch.probe_cluster(c, snapshot.instances_of(&c.cluster_id))),
        )
        .await
    }

    /// Exclusive ClusterSet lock on every reachable cluster primary, taken
    /// in address order.
    pub(crate) async fn lock_clusterset(
        &self,
        set: &ClusterSetRecord,
        views: &[ClusterView],
    ) -> Result<HeldLocks> {
        let mut primaries: Vec<String> = views
            .iter()
            .filter_map(|v| v.primary().map(String::from))
            .collect();
        primaries.sort();
        primaries.dedup();

        let name = clusterset_lock(&set.clusterset_id);
        let mut locks = HeldLocks::new();
        for address in &primaries {
            let acquired = match self.orch.connect(address).await {
                Ok(instance) => {
                    let res = self
                        .orch
                        .lock(&mut locks, &instance, &[(name.clone(), true)])
                        .await;
                    if res.is_err() {
                        instance.close().await;
                    }
                    res
                }
                Err(e) => Err(e),
            };
            if let Err(e) = acquired {
                locks.release().await;
                return Err(e);
            }
        }
        Ok(locks)
    }

    /// Errant transactions of `candidate` relative to `reference`
    pub(crate) fn errant(candidate: &GtidSet, reference: &GtidSet) -> Option<GtidSet> {
        let extra = candidate.subtract(reference);
        (!extra.is_empty()).then_some(extra)
    }

    /// Re-probe a cluster once the locks are held. It must still have quorum
    /// and the same primary that planning saw.
    pub(crate) async fn recheck_primary(&self, view: &ClusterView, expected: &str) -> Result<()> {
        let view = self.orch.reprobe(view).await;
        let primary = view.require_available()?;
        if primary != expected {
            return Err(Error::InvalidState(format!(
                "the primary of cluster '{}' changed from {} to {} while waiting for the lock; retry the operation",
                view.name(),
                expected,
                primary
            )));
        }
        Ok(())
    }

    // === createReplicaCluster ===

    /// Bootstrap a new cluster on `address` replicating from the global
    /// primary.
    pub async fn create_replica_cluster(
        &self,
        address: &str,
        name: &str,
        opts: ReplicaClusterOptions,
    ) -> Result<OperationReport> {
        validate_address(address)?;
        validate_name("cluster", name)?;
        opts.validate()?;

        let (resolved, set) = self.resolve(true).await?;
        let snapshot = &resolved.snapshot;
        if snapshot.cluster_by_name(name).is_some() {
            return Err(Error::InvalidState(format!("cluster '{}' already exists", name)));
        }
        if let Some(cluster) = snapshot.cluster_of(address) {
            return Err(Error::InvalidState(format!(
                "{} is already registered in cluster '{}'",
                address, cluster.name
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

        let target = self.orch.connect(address).await?;
        let result = self
            .create_replica_cluster_on(&target, name, &opts, &set, &primary, &global, &global_gtid)
            .await;
        target.close().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_replica_cluster_on(
        &self,
        target: &Instance,
        name: &str,
        opts: &ReplicaClusterOptions,
        set: &ClusterSetRecord,
        primary: &ClusterView,
        global: &str,
        global_gtid: &GtidSet,
    ) -> Result<OperationReport> {
        let address = target.address();
        let info = target.member_info().await?;
        if info.member_state.is_active() {
            return Err(Error::InvalidState(format!(
                "{} is already an active member of group {}",
                address,
                info.group_name.as_deref().unwrap_or("?")
            )));
        }
        let clone = match (opts.recovery_method, Self::errant(&info.gtid_executed, global_gtid)) {
            (RecoveryMethod::Clone, _) => true,
            (_, Some(errant)) => {
                return Err(Error::provisioning(
                    address,
                    format!(
                        "it has transactions the ClusterSet does not have ({}); use recoveryMethod clone",
                        errant
                    ),
                ))
            }
            (_, None) => false,
        };

        let mut report = OperationReport::new("createReplicaCluster").with_dry_run(opts.dry_run);
        if opts.dry_run {
            if clone {
                report.action(format!("clone {} from {}", address, global));
            }
            report.action(format!("bootstrap cluster '{}' on {}", name, address));
            report.action(format!(
                "replicate {} from {} over the ClusterSet channel",
                address, global
            ));
            report.action(format!("register cluster '{}' as REPLICA", name));
            return Ok(report);
        }

        let anchor = self.orch.connect(global).await?;
        let mut locks = HeldLocks::new();
        if let Err(e) = self
            .orch
            .lock(
                &mut locks,
                &anchor,
                &[(clusterset_lock(&set.clusterset_id), false)],
            )
            .await
        {
            locks.release().await;
            anchor.close().await;
            return Err(e);
        }
        let result = self
            .create_replica_cluster_locked(
                target, &info, name, opts, set, primary, global, clone, report,
            )
            .await;
        locks.release().await;
        anchor.close().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_replica_cluster_locked(
        &self,
        target: &Instance,
        info: &crate::topology::session::MemberInfoRow,
        name: &str,
        opts: &ReplicaClusterOptions,
        set: &ClusterSetRecord,
        primary: &ClusterView,
        global: &str,
        clone: bool,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        self.recheck_primary(primary, global).await?;
        let address = target.address().to_string();
        if clone {
            target
                .execute(Statement::Clone {
                    donor: global.to_string(),
                })
                .await?;
            report.action(format!("clone {} from {}", address, global));
        }

        let group_name = uuid::Uuid::new_v4().to_string();
        target
            .execute(Statement::StartGroupReplication {
                group_name: group_name.clone(),
                bootstrap: true,
                multi_primary: false,
                seeds: vec![address.clone()],
                member_weight: opts.member.member_weight,
                exit_state_action: opts.member.exit_state_action,
            })
            .await?;
        target.set_super_read_only(true).await?;
        target.set_auto_increment(SINGLE_PRIMARY_AUTO_INCREMENT).await?;
        report.action(format!("bootstrap cluster '{}' on {}", name, address));

        let deadline = self.orch.deadline();
        let group = group_name.as_str();
        self.orch
            .wait_for_member("the replica cluster to come ONLINE", &address, deadline, |r| {
                r.state == MemberState::Online && r.group_name.as_deref() == Some(group)
            })
            .await?;

        target.configure_clusterset_channel(global).await?;
        report.action(format!(
            "replicate {} from {} over the ClusterSet channel",
            address, global
        ));
        self.orch
            .wait_for_member("the ClusterSet channel to start", &address, deadline, |r| {
                r.channel(CLUSTERSET_CHANNEL)
                    .map(|c| c.is_running() && c.source.as_deref() == Some(global))
                    .unwrap_or(false)
            })
            .await?;

        let cluster_id = uuid::Uuid::new_v4().to_string();
        let mut txn = MetadataTxn::new();
        txn.put_cluster(&ClusterRecord {
            cluster_id: cluster_id.clone(),
            name: name.to_string(),
            topology_mode: TopologyMode::SinglePrimary,
            group_name,
            primary_instance: Some(address.clone()),
            clusterset_id: Some(set.clusterset_id.clone()),
            attributes: Default::default(),
            created_at: timestamp_now(),
        })?;
        txn.put_instance(&InstanceRecord {
            instance_id: info.server_uuid.clone(),
            cluster_id: cluster_id.clone(),
            address: address.clone(),
            server_id: info.server_id,
            options: opts.member.to_instance_options(),
        })?;
        txn.put_role(&ClusterRoleRecord {
            clusterset_id: set.clusterset_id.clone(),
            cluster_id,
            role: ClusterRole::Replica,
            invalidated: false,
        })?;
        self.orch.commit_metadata(global, txn).await?;
        report.action(format!("register cluster '{}' as REPLICA", name));

        report.info(format!(
            "Replica Cluster '{}' successfully created on ClusterSet '{}'.",
            name, self.domain
        ));
        self.orch.audit().log_event(
            AuditEventType::ReplicaClusterCreated,
            "orchestrator",
            Some(name.to_string()),
            format!("replica cluster created on {} in '{}'", address, self.domain),
            Some(serde_json::json!({ "clone": clone })),
        );
        Ok(report)
    }

    // === removeCluster ===

    pub async fn remove_cluster(
        &self,
        name: &str,
        opts: RemoveClusterOptions,
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
                "cluster '{}' is the PRIMARY cluster and cannot be removed; switch the primary role first",
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

        let view = self.orch.cluster_view(snapshot, &record.cluster_id).await?;
        let reachable = view.is_available();
        if !reachable && !opts.force {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is not available ({}); use force to remove it from metadata only",
                name, view.health.status
            )));
        }

        let mut report = OperationReport::new("removeCluster").with_dry_run(opts.dry_run);
        if opts.dry_run {
            if reachable {
                report.action(format!("stop the ClusterSet channel of cluster '{}'", name));
                report.action(format!("stop group replication on every member of '{}'", name));
            }
            report.action(format!("unregister cluster '{}'", name));
            return Ok(report);
        }

        let anchor = self.orch.connect(&global).await?;
        let mut locks = HeldLocks::new();
        if let Err(e) = self
            .orch
            .lock(
                &mut locks,
                &anchor,
                &[(clusterset_lock(&set.clusterset_id), false)],
            )
            .await
        {
            locks.release().await;
            anchor.close().await;
            return Err(e);
        }
        let result = self
            .remove_cluster_locked(snapshot, &primary, &view, &global, reachable, report)
            .await;
        locks.release().await;
        anchor.close().await;
        result
    }

    async fn remove_cluster_locked(
        &self,
        snapshot: &MetadataSnapshot,
        primary_view: &ClusterView,
        view: &ClusterView,
        global: &str,
        reachable: bool,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        self.recheck_primary(primary_view, global).await?;
        let name = view.name().to_string();
        if reachable {
            let view = self.orch.reprobe(view).await;
            let primary = view.require_available()?;

            let instance = self.orch.connect(&primary).await?;
            let res = async {
                instance.remove_clusterset_channel().await?;
                instance.set_super_read_only(false).await?;
                MetadataStore::new(instance.clone()).drop_schema().await
            }
            .await;
            instance.close().await;
            res?;
            report.action(format!("remove the ClusterSet channel from {}", primary));
            report.action(format!("drop the metadata schema of cluster '{}'", name));

            let mut members: Vec<String> = view
                .health
                .members
                .iter()
                .filter(|m| m.in_view && m.reachable && m.address != primary)
                .map(|m| m.address.clone())
                .collect();
            members.push(primary);
            for address in &members {
                let instance = self.orch.connect(address).await?;
                let res = instance.execute(Statement::StopGroupReplication).await;
                instance.close().await;
                res?;
                report.action(format!("stop group replication on {}", address));
            }
        } else {
            report.warn(format!(
                "cluster '{}' was unreachable and was only removed from metadata; its members still have group replication configured",
                name
            ));
        }

        let mut txn = MetadataTxn::new();
        for instance in snapshot.instances_of(&view.record.cluster_id) {
            txn.delete_instance(&instance.instance_id);
        }
        txn.delete_role(&view.record.cluster_id);
        txn.delete_cluster(&view.record.cluster_id);
        self.orch.commit_metadata(global, txn).await?;
        report.action(format!("unregister cluster '{}'", name));

        report.info(format!(
            "The Cluster '{}' was removed from the ClusterSet.",
            name
        ));
        self.orch.audit().log_event(
            AuditEventType::ReplicaClusterRemoved,
            "orchestrator",
            Some(name),
            format!("removed from ClusterSet '{}'", self.domain),
            Some(serde_json::json!({ "metadata_only": !reachable })),
        );
        Ok(report)
    }
}

impl Cluster {
    // === createClusterSet ===

    /// Turn this cluster into the PRIMARY cluster of a new ClusterSet
    pub async fn create_clusterset(&self, domain: &str) -> Result<ClusterSet> {
        validate_name("ClusterSet", domain)?;

        let ctx = self.context(true).await?;
        let primary = ctx.view.require_available()?;
        if ctx.view.record.topology_mode != TopologyMode::SinglePrimary
            || ctx.view.health.multi_primary != Some(false)
        {
            return Err(Error::InvalidState(format!(
                "cluster '{}' must be in single-primary mode to join a ClusterSet",
                self.name
            )));
        }
        if let Some(set) = ctx.clusterset() {
            return Err(Error::InvalidState(format!(
                "cluster '{}' already belongs to ClusterSet '{}'",
                self.name, set.domain
            )));
        }

        let locks = self.lock_on(&primary, &ctx.view.record).await?;
        let result = async {
            let view = self.orch.reprobe(&ctx.view).await;
            let primary = view.require_available()?;

            let set = ClusterSetRecord {
                clusterset_id: uuid::Uuid::new_v4().to_string(),
                domain: domain.to_string(),
                primary_cluster: view.record.cluster_id.clone(),
                generation: 0,
                attributes: Default::default(),
            };
            let mut record = view.record.clone();
            record.clusterset_id = Some(set.clusterset_id.clone());
            let mut txn = MetadataTxn::new();
            txn.put_clusterset(&set)?;
            txn.put_role(&ClusterRoleRecord {
                clusterset_id: set.clusterset_id.clone(),
                cluster_id: record.cluster_id.clone(),
                role: ClusterRole::Primary,
                invalidated: false,
            })?;
            txn.put_cluster(&record)?;
            self.orch.commit_metadata(&primary, txn).await
        }
        .await;
        locks.release().await;
        result?;

        tracing::info!("ClusterSet '{}' created with primary cluster '{}'", domain, self.name);
        self.orch.audit().log_event(
            AuditEventType::ClusterSetCreated,
            "orchestrator",
            Some(domain.to_string()),
            format!("primary cluster '{}'", self.name),
            None,
        );
        Ok(ClusterSet::new(self.orch.clone(), &self.entry, domain))
    }
}

impl Orchestrator {
    /// Point the ClusterSet channel of every valid replica cluster of `set`
    /// (other than the primary cluster and `skip`) at `source`. Clusters
    /// that cannot be reached are reported and left for `rejoinCluster`.
    pub(crate) async fn redirect_replica_clusters(
        &self,
        snapshot: &MetadataSnapshot,
        set: &ClusterSetRecord,
        skip: &[String],
        source: &str,
        report: &mut OperationReport,
    ) -> Result<()> {
        for cluster in snapshot.clusters_in(&set.clusterset_id) {
            if cluster.cluster_id == set.primary_cluster || skip.contains(&cluster.cluster_id) {
                continue;
            }
            if snapshot
                .role_of(&cluster.cluster_id)
                .map(|r| r.invalidated)
                .unwrap_or(false)
            {
                continue;
            }
            let view = self.cluster_view(snapshot, &cluster.cluster_id).await?;
            let Some(primary) = view.primary().map(String::from) else {
                report.warn(format!(
                    "replica cluster '{}' is not available and still replicates from the old source; use rejoinCluster once it is back",
                    cluster.name
                ));
                continue;
            };
            let res = match self.connect(&primary).await {
                Ok(instance) => {
                    let res = instance.configure_clusterset_channel(source).await;
                    instance.close().await;
                    res
                }
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => report.action(format!(
                    "redirect replica cluster '{}' ({}) to {}",
                    cluster.name, primary, source
                )),
                Err(e) => report.warn(format!(
                    "could not redirect replica cluster '{}': {}; use rejoinCluster",
                    cluster.name, e
                )),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::common::ErrorKind;
    use crate::testing::{build_clusterset, orchestrator, Fleet};
    use crate::{ClusterSet, Orchestrator};

    const P: [&str; 3] = ["p1:3306", "p2:3306", "p3:3306"];
    const R: [&str; 2] = ["r1:3306", "r2:3306"];

    async fn setup() -> (Fleet, Orchestrator, ClusterSet) {
        let addresses: Vec<&str> = P.iter().chain(R.iter()).copied().collect();
        let fleet = Fleet::with_instances(&addresses);
        let orch = orchestrator(&fleet);
        let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
            .await
            .unwrap();
        (fleet, orch, set)
    }

    #[tokio::test]
    async fn test_recheck_sees_quorum_lost_after_planning() {
        let (fleet, orch, set) = setup().await;
        let (resolved, record) = set.resolve(true).await.unwrap();
        let planned = orch
            .cluster_view(&resolved.snapshot, &record.primary_cluster)
            .await
            .unwrap();
        set.recheck_primary(&planned, P[0]).await.unwrap();

        fleet.kill_all(&P[1..]);
        let err = set.recheck_primary(&planned, P[0]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoQuorum);
    }

    #[tokio::test]
    async fn test_recheck_sees_primary_change() {
        let (fleet, orch, set) = setup().await;
        let (resolved, record) = set.resolve(true).await.unwrap();
        let planned = orch
            .cluster_view(&resolved.snapshot, &record.primary_cluster)
            .await
            .unwrap();

        fleet.kill(P[0]);
        let err = set.recheck_primary(&planned, P[0]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
