//! Cluster lifecycle and membership
//!
//! `createCluster`, `addInstance`, `removeInstance`, `rejoinInstance`,
//! `dissolve` and `rebootClusterFromCompleteOutage`.

use crate::common::{
    timestamp_now, validate_address, validate_name, AuditEventType, Error, Result, SchemaVersion,
};
use crate::coordinator::options::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, RebootOptions, RecoveryMethod,
    RejoinInstanceOptions, RemoveInstanceOptions,
};
use crate::coordinator::report::{OperationReport, SPLIT_BRAIN_WARNING};
use crate::coordinator::{ClusterView, Orchestrator, ResolvedMetadata};
use crate::metadata::{
    cluster_lock, clusterset_lock, gate_version, HeldLocks, MetadataSnapshot, MetadataStore,
    MetadataTxn,
};
use crate::topology::model::{multi_primary_auto_increment, SINGLE_PRIMARY_AUTO_INCREMENT};
use crate::topology::session::MemberInfoRow;
use crate::topology::{
    ClusterRecord, ClusterRole, ClusterRoleRecord, ClusterSetRecord, Instance, InstanceRecord,
    MemberClassification, MemberState, ProbeOutcome, QuorumEvaluator, Statement, TopologyMode,
};

/// Handle to one cluster. Holds only the cluster name and the address used
/// to reach metadata; everything else is re-read on every call.
#[derive(Clone)]
pub struct Cluster {
    pub(crate) orch: Orchestrator,
    pub(crate) entry: String,
    pub(crate) name: String,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .finish()
    }
}

/// Everything one cluster operation plans against
#[derive(Debug, Clone)]
pub(crate) struct ClusterContext {
    pub resolved: ResolvedMetadata,
    pub view: ClusterView,
}

impl ClusterContext {
    pub fn snapshot(&self) -> &MetadataSnapshot {
        &self.resolved.snapshot
    }

    pub fn clusterset(&self) -> Option<&ClusterSetRecord> {
        self.view
            .record
            .clusterset_id
            .as_deref()
            .and_then(|id| self.snapshot().clusterset(id))
    }

    pub fn role(&self) -> Option<&ClusterRoleRecord> {
        self.snapshot().role_of(&self.view.record.cluster_id)
    }

    /// Valid (not invalidated) replica cluster of a ClusterSet
    pub fn is_active_replica(&self) -> bool {
        self.role()
            .map(|r| r.role == ClusterRole::Replica && !r.invalidated)
            .unwrap_or(false)
    }
}

impl Cluster {
    pub(crate) fn new(orch: Orchestrator, entry: &str, name: &str) -> Self {
        Self {
            orch,
            entry: entry.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Resolve metadata and probe every member
    pub(crate) async fn context(&self, for_write: bool) -> Result<ClusterContext> {
        let resolved = self.orch.resolve_metadata(&self.entry).await?;
        resolved.gate(for_write)?;
        let record = resolved.cluster(&self.name)?.clone();
        let view = self
            .orch
            .probe_cluster(&record, resolved.snapshot.instances_of(&record.cluster_id))
            .await;
        Ok(ClusterContext { resolved, view })
    }

    /// Instance metadata changes of this cluster are committed through: the
    /// global primary inside a ClusterSet, the cluster's own primary
    /// otherwise.
    pub(crate) async fn metadata_writer(
        &self,
        snapshot: &MetadataSnapshot,
        view: &ClusterView,
    ) -> Result<String> {
        let set = view
            .record
            .clusterset_id
            .as_deref()
            .and_then(|id| snapshot.clusterset(id));
        match set {
            Some(set) if set.primary_cluster != view.record.cluster_id => {
                let primary = self.orch.cluster_view(snapshot, &set.primary_cluster).await?;
                primary.require_available().map_err(|e| {
                    Error::InvalidState(format!(
                        "primary cluster '{}' is not available, metadata cannot be updated: {}",
                        primary.name(),
                        e
                    ))
                })
            }
            _ => view.require_available(),
        }
    }

    /// Exclusive cluster lock plus shared ClusterSet lock, on `address`
    pub(crate) async fn lock_on(&self, address: &str, record: &ClusterRecord) -> Result<HeldLocks> {
        let instance = self.orch.connect(address).await?;
        let mut names = vec![(cluster_lock(&record.cluster_id), true)];
        if let Some(set) = &record.clusterset_id {
            names.push((clusterset_lock(set), false));
        }
        let mut locks = HeldLocks::new();
        if let Err(e) = self.orch.lock(&mut locks, &instance, &names).await {
            locks.release().await;
            instance.close().await;
            return Err(e);
        }
        Ok(locks)
    }

    pub(crate) async fn lock_cluster(&self, ctx: &ClusterContext) -> Result<HeldLocks> {
        let primary = ctx.view.require_available()?;
        self.lock_on(&primary, &ctx.view.record).await
    }

    /// Re-validate quorum right before acting
    pub(crate) async fn revalidate(&self, view: &ClusterView) -> Result<ClusterView> {
        let fresh = self.orch.reprobe(view).await;
        fresh.require_quorum()?;
        Ok(fresh)
    }

    /// Point the ClusterSet channel of a replica cluster at `source` from
    /// `new_primary`, removing it from `old_primary` when that is reachable.
    pub(crate) async fn move_clusterset_channel(
        &self,
        old_primary: Option<&str>,
        new_primary: &str,
        source: &str,
        report: &mut OperationReport,
    ) -> Result<()> {
        if let Some(old) = old_primary.filter(|o| *o != new_primary) {
            match self.orch.connect(old).await {
                Ok(instance) => {
                    let res = instance.remove_clusterset_channel().await;
                    instance.close().await;
                    match res {
                        Ok(()) => report.action(format!("remove ClusterSet channel from {}", old)),
                        Err(e) => report.warn(format!(
                            "could not remove the ClusterSet channel from {}: {}",
                            old, e
                        )),
                    }
                }
                Err(e) => report.warn(format!(
                    "could not remove the ClusterSet channel from {}: {}",
                    old, e
                )),
            }
        }
        let instance = self.orch.connect(new_primary).await?;
        let res = async {
            instance.set_super_read_only(true).await?;
            instance.configure_clusterset_channel(source).await
        }
        .await;
        instance.close().await;
        res?;
        report.action(format!(
            "replicate {} from {} over the ClusterSet channel",
            new_primary, source
        ));
        Ok(())
    }

    pub(crate) async fn apply_auto_increment(
        &self,
        view: &ClusterView,
        report: &mut OperationReport,
    ) -> Result<()> {
        let members = view.online();
        for address in &members {
            let Some(probe) = view.probe(address) else { continue };
            let values = multi_primary_auto_increment(probe.server_id, members.len());
            let instance = self.orch.connect(address).await?;
            let res = instance.set_auto_increment(values).await;
            instance.close().await;
            res?;
            report.action(format!(
                "set auto_increment_increment={} auto_increment_offset={} on {}",
                values.0, values.1, address
            ));
        }
        Ok(())
    }

    // === addInstance ===

    pub async fn add_instance(
        &self,
        address: &str,
        opts: AddInstanceOptions,
    ) -> Result<OperationReport> {
        validate_address(address)?;
        opts.validate()?;

        let ctx = self.context(true).await?;
        ctx.view.require_quorum()?;
        if let Some(cluster) = ctx.snapshot().cluster_of(address) {
            return Err(Error::InvalidState(format!(
                "{} is already registered in cluster '{}'",
                address, cluster.name
            )));
        }
        let primary = ctx.view.require_available()?;
        let donor = ctx
            .view
            .primary_probe()
            .ok_or_else(|| Error::unreachable(&primary, "primary probe missing"))?
            .clone();

        let target = self.orch.connect(address).await?;
        let info = target.member_info().await?;
        if info.member_state.is_active() {
            target.close().await;
            return Err(Error::InvalidState(format!(
                "{} is already an active member of group {}",
                address,
                info.group_name.as_deref().unwrap_or("?")
            )));
        }

        let errant = info.gtid_executed.subtract(&donor.gtid_executed);
        let clone = match opts.recovery_method {
            RecoveryMethod::Clone => true,
            _ if !errant.is_empty() => {
                target.close().await;
                return Err(Error::provisioning(
                    address,
                    format!(
                        "it has transactions not present in cluster '{}' ({}); use recoveryMethod clone",
                        self.name, errant
                    ),
                ));
            }
            _ => false,
        };

        let writer = match self.metadata_writer(ctx.snapshot(), &ctx.view).await {
            Ok(w) => w,
            Err(e) => {
                target.close().await;
                return Err(e);
            }
        };

        let locks = match self.lock_cluster(&ctx).await {
            Ok(l) => l,
            Err(e) => {
                target.close().await;
                return Err(e);
            }
        };
        let result = self
            .add_instance_locked(&ctx, &target, &info, &primary, &writer, clone, &opts)
            .await;
        locks.release().await;
        target.close().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_instance_locked(
        &self,
        ctx: &ClusterContext,
        target: &Instance,
        info: &MemberInfoRow,
        primary: &str,
        writer: &str,
        clone: bool,
        opts: &AddInstanceOptions,
    ) -> Result<OperationReport> {
        let address = target.address();
        let view = self.revalidate(&ctx.view).await?;
        let mut report = OperationReport::new("addInstance");

        if clone {
            target
                .execute(Statement::Clone {
                    donor: primary.to_string(),
                })
                .await?;
            report.action(format!("clone {} from {}", address, primary));
        }

        let multi_primary = view.health.multi_primary == Some(true);
        target
            .execute(Statement::StartGroupReplication {
                group_name: view.record.group_name.clone(),
                bootstrap: false,
                multi_primary,
                seeds: view.online(),
                member_weight: opts.member.member_weight,
                exit_state_action: opts.member.exit_state_action,
            })
            .await?;
        report.action(format!("join {} to the group of cluster '{}'", address, self.name));

        let deadline = self.orch.deadline();
        let joined = self
            .orch
            .wait_for_cluster(&format!("{} to become ONLINE", address), &view, deadline, |v| {
                v.health
                    .member(address)
                    .map(|m| m.state == MemberClassification::Online)
                    .unwrap_or(false)
            })
            .await?;

        if multi_primary {
            self.apply_auto_increment(&joined, &mut report).await?;
        } else {
            target.set_auto_increment(SINGLE_PRIMARY_AUTO_INCREMENT).await?;
        }

        let mut txn = MetadataTxn::new();
        txn.put_instance(&InstanceRecord {
            instance_id: info.server_uuid.clone(),
            cluster_id: view.record.cluster_id.clone(),
            address: address.to_string(),
            server_id: info.server_id,
            options: opts.member.to_instance_options(),
        })?;
        self.orch.commit_metadata(writer, txn).await?;
        report.action(format!("register {} in metadata", address));

        report.info(format!(
            "The instance '{}' was successfully added to the cluster.",
            address
        ));
        self.orch.audit().log_event(
            AuditEventType::InstanceAdded,
            "orchestrator",
            Some(address.to_string()),
            format!("added to cluster '{}'", self.name),
            Some(serde_json::json!({ "clone": clone })),
        );
        Ok(report)
    }

    // === removeInstance ===

    pub async fn remove_instance(
        &self,
        address: &str,
        opts: RemoveInstanceOptions,
    ) -> Result<OperationReport> {
        validate_address(address)?;

        let ctx = self.context(true).await?;
        ctx.view.require_quorum()?;
        let record = ctx
            .view
            .registered(address)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "{} is not a member of cluster '{}'",
                    address, self.name
                ))
            })?;
        if ctx.view.instances.len() == 1 {
            return Err(Error::InvalidState(format!(
                "{} is the last member of cluster '{}'; use dissolve instead",
                address, self.name
            )));
        }

        let reachable = ctx.view.probe(address).is_some();
        if !reachable && !opts.force {
            return Err(Error::unreachable(
                address,
                "instance cannot be contacted; use force to remove it from metadata only",
            ));
        }
        let in_view = ctx
            .view
            .health
            .member(address)
            .map(|m| m.in_view)
            .unwrap_or(false);
        let old_primary = ctx.view.primary().map(String::from);
        if old_primary.as_deref() == Some(address)
            && ctx.view.online().iter().all(|a| a == address)
        {
            return Err(Error::InvalidState(format!(
                "{} is the only ONLINE member; removing it would leave the cluster without a primary",
                address
            )));
        }

        let locks = self.lock_cluster(&ctx).await?;
        let result = self
            .remove_instance_locked(&ctx, &record, reachable && in_view, old_primary.as_deref())
            .await;
        locks.release().await;
        result
    }

    async fn remove_instance_locked(
        &self,
        ctx: &ClusterContext,
        record: &InstanceRecord,
        leave_group: bool,
        old_primary: Option<&str>,
    ) -> Result<OperationReport> {
        let address = record.address.as_str();
        let mut view = self.revalidate(&ctx.view).await?;
        let mut report = OperationReport::new("removeInstance");

        if leave_group {
            let target = self.orch.connect(address).await?;
            let res = target.execute(Statement::StopGroupReplication).await;
            target.close().await;
            res?;
            report.action(format!("stop group replication on {}", address));

            let deadline = self.orch.deadline();
            view = self
                .orch
                .wait_for_cluster(&format!("{} to leave the group", address), &view, deadline, |v| {
                    v.health.quorum
                        && v.primary().is_some()
                        && v.health.member(address).map(|m| !m.in_view).unwrap_or(true)
                })
                .await?;
        } else {
            report.warn(format!(
                "{} could not be contacted and was only removed from metadata; stop group replication on it before reusing it",
                address
            ));
        }

        let new_primary = view.primary().map(String::from);
        if ctx.is_active_replica() && old_primary == Some(address) {
            if let Some(new_primary) = &new_primary {
                let source = self.metadata_writer(ctx.snapshot(), &view).await?;
                self.move_clusterset_channel(
                    leave_group.then_some(address),
                    new_primary,
                    &source,
                    &mut report,
                )
                .await?;
            }
        }

        let writer = self.metadata_writer(ctx.snapshot(), &view).await?;
        let mut txn = MetadataTxn::new();
        txn.delete_instance(&record.instance_id);
        if view.record.topology_mode == TopologyMode::SinglePrimary
            && view.record.primary_instance.as_deref() != new_primary.as_deref()
        {
            let mut cluster = view.record.clone();
            cluster.primary_instance = new_primary.clone();
            txn.put_cluster(&cluster)?;
        }
        self.orch.commit_metadata(&writer, txn).await?;
        report.action(format!("unregister {} from metadata", address));

        report.info(format!(
            "The instance '{}' was successfully removed from the cluster.",
            address
        ));
        self.orch.audit().log_event(
            AuditEventType::InstanceRemoved,
            "orchestrator",
            Some(address.to_string()),
            format!("removed from cluster '{}'", self.name),
            None,
        );
        Ok(report)
    }

    // === rejoinInstance ===

    pub async fn rejoin_instance(
        &self,
        address: &str,
        opts: RejoinInstanceOptions,
    ) -> Result<OperationReport> {
        validate_address(address)?;

        let ctx = self.context(true).await?;
        ctx.view.require_quorum()?;
        if ctx.view.registered(address).is_none() {
            return Err(Error::InvalidState(format!(
                "{} is not registered in cluster '{}'; use addInstance",
                address, self.name
            )));
        }

        let mut report = OperationReport::new("rejoinInstance");
        let member = ctx.view.health.member(address);
        if member.map(|m| m.in_view && m.state == MemberClassification::Online) == Some(true) {
            report.info(format!("{} is already an ONLINE member of the cluster", address));
            return Ok(report);
        }

        let primary = ctx.view.require_available()?;
        let donor = ctx
            .view
            .primary_probe()
            .ok_or_else(|| Error::unreachable(&primary, "primary probe missing"))?
            .clone();

        let target = self.orch.connect(address).await?;
        let info = match target.member_info().await {
            Ok(info) => info,
            Err(e) => {
                target.close().await;
                return Err(e);
            }
        };
        if info.member_state.is_active() {
            target.close().await;
            return Err(Error::InvalidState(format!(
                "{} still considers itself {} in its own view of the group; stop group replication on it first",
                address, info.member_state
            )));
        }

        let errant = info.gtid_executed.subtract(&donor.gtid_executed);
        let clone = match opts.recovery_method {
            RecoveryMethod::Clone => true,
            _ if !errant.is_empty() => {
                target.close().await;
                return Err(Error::provisioning(
                    address,
                    format!(
                        "it has transactions the cluster does not have ({}); use recoveryMethod clone or remove and re-add it",
                        errant
                    ),
                ));
            }
            _ => false,
        };

        let locks = match self.lock_cluster(&ctx).await {
            Ok(l) => l,
            Err(e) => {
                target.close().await;
                return Err(e);
            }
        };
        let result = self
            .rejoin_instance_locked(&ctx, &target, &info, &primary, clone, report)
            .await;
        locks.release().await;
        target.close().await;
        result
    }

    async fn rejoin_instance_locked(
        &self,
        ctx: &ClusterContext,
        target: &Instance,
        info: &MemberInfoRow,
        primary: &str,
        clone: bool,
        mut report: OperationReport,
    ) -> Result<OperationReport> {
        let address = target.address();
        let view = self.revalidate(&ctx.view).await?;

        if info.member_state == MemberState::Error {
            target.execute(Statement::StopGroupReplication).await?;
            report.action(format!("stop group replication on {}", address));
        }
        if clone {
            target
                .execute(Statement::Clone {
                    donor: primary.to_string(),
                })
                .await?;
            report.action(format!("clone {} from {}", address, primary));
        }

        let options = view
            .registered(address)
            .map(|r| r.options.clone())
            .unwrap_or_default();
        let multi_primary = view.health.multi_primary == Some(true);
        target
            .execute(Statement::StartGroupReplication {
                group_name: view.record.group_name.clone(),
                bootstrap: false,
                multi_primary,
                seeds: view.online(),
                member_weight: options.member_weight,
                exit_state_action: options.exit_state_action,
            })
            .await?;
        report.action(format!("rejoin {} to the group", address));

        let deadline = self.orch.deadline();
        let joined = self
            .orch
            .wait_for_cluster(&format!("{} to become ONLINE", address), &view, deadline, |v| {
                v.health
                    .member(address)
                    .map(|m| m.in_view && m.state == MemberClassification::Online)
                    .unwrap_or(false)
            })
            .await?;
        if multi_primary {
            self.apply_auto_increment(&joined, &mut report).await?;
        }

        report.info(format!(
            "The instance '{}' was successfully rejoined to the cluster.",
            address
        ));
        self.orch.audit().log_event(
            AuditEventType::InstanceRejoined,
            "orchestrator",
            Some(address.to_string()),
            format!("rejoined cluster '{}'", self.name),
            None,
        );
        Ok(report)
    }

    // === dissolve ===

    pub async fn dissolve(&self, opts: DissolveOptions) -> Result<OperationReport> {
        let ctx = self.context(true).await?;
        ctx.view.require_quorum()?;
        if ctx.clusterset().is_some() {
            return Err(Error::InvalidState(format!(
                "cluster '{}' belongs to a ClusterSet; remove it from the ClusterSet first",
                self.name
            )));
        }

        let unreachable: Vec<String> = ctx
            .view
            .instances
            .iter()
            .filter(|i| ctx.view.probe(&i.address).is_none())
            .map(|i| i.address.clone())
            .collect();
        if !unreachable.is_empty() && !opts.force {
            return Err(Error::InvalidState(format!(
                "members {} are unreachable; use force to dissolve anyway",
                unreachable.join(", ")
            )));
        }

        let locks = self.lock_cluster(&ctx).await?;
        let result = self.dissolve_locked(&ctx, &unreachable).await;
        locks.release().await;
        result
    }

    async fn dissolve_locked(
        &self,
        ctx: &ClusterContext,
        unreachable: &[String],
    ) -> Result<OperationReport> {
        let view = self.revalidate(&ctx.view).await?;
        let primary = view.require_available()?;
        let mut report = OperationReport::new("dissolve");
        report.warn(SPLIT_BRAIN_WARNING);

        let instance = self.orch.connect(&primary).await?;
        let res = MetadataStore::new(instance.clone()).drop_schema().await;
        instance.close().await;
        res?;
        report.action("drop the metadata schema".to_string());

        let secondaries: Vec<String> = view
            .health
            .members
            .iter()
            .filter(|m| m.in_view && m.reachable && m.address != primary)
            .map(|m| m.address.clone())
            .collect();
        for address in secondaries.iter().chain(std::iter::once(&primary)) {
            let instance = self.orch.connect(address).await?;
            let res = instance.execute(Statement::StopGroupReplication).await;
            instance.close().await;
            res?;
            report.action(format!("stop group replication on {}", address));
        }

        for address in unreachable {
            report.warn(format!(
                "{} was unreachable and still has group replication configured",
                address
            ));
        }
        report.info(format!("The cluster '{}' was successfully dissolved.", self.name));
        self.orch.audit().log_event(
            AuditEventType::ClusterDissolved,
            "orchestrator",
            Some(self.name.clone()),
            format!("cluster dissolved; {}", SPLIT_BRAIN_WARNING),
            None,
        );
        Ok(report)
    }
}

impl Orchestrator {
    // === createCluster ===

    /// Bootstrap a new cluster on `seed`
    pub async fn create_cluster(
        &self,
        seed: &str,
        name: &str,
        opts: CreateClusterOptions,
    ) -> Result<Cluster> {
        validate_address(seed)?;
        validate_name("cluster", name)?;
        opts.validate()?;

        let instance = self.connect(seed).await?;
        let result = self.create_cluster_on(&instance, name, &opts).await;
        instance.close().await;
        result?;
        Ok(Cluster::new(self.clone(), seed, name))
    }

    async fn create_cluster_on(
        &self,
        instance: &Instance,
        name: &str,
        opts: &CreateClusterOptions,
    ) -> Result<()> {
        let seed = instance.address();
        let info = instance.member_info().await?;
        if info.member_state.is_active() {
            return Err(Error::InvalidState(format!(
                "{} is already an active member of group {}",
                seed,
                info.group_name.as_deref().unwrap_or("?")
            )));
        }
        let store = MetadataStore::new(instance.clone());
        let existing = store.load().await?;
        if let Some(cluster) = existing.cluster_of(seed) {
            return Err(Error::InvalidState(format!(
                "{} is already registered in cluster '{}'; use rebootClusterFromCompleteOutage or dissolve it first",
                seed, cluster.name
            )));
        }

        let group_name = opts
            .group_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::info!("Creating cluster '{}' on {} (group {})", name, seed, group_name);

        instance
            .execute(Statement::StartGroupReplication {
                group_name: group_name.clone(),
                bootstrap: true,
                multi_primary: opts.multi_primary,
                seeds: vec![seed.to_string()],
                member_weight: opts.member.member_weight,
                exit_state_action: opts.member.exit_state_action,
            })
            .await?;
        let auto_increment = if opts.multi_primary {
            multi_primary_auto_increment(info.server_id, 1)
        } else {
            SINGLE_PRIMARY_AUTO_INCREMENT
        };
        instance.set_auto_increment(auto_increment).await?;

        let group = group_name.as_str();
        self.wait_for_member("seed to come ONLINE", seed, self.deadline(), |r| {
            r.state == MemberState::Online && r.group_name.as_deref() == Some(group)
        })
        .await?;

        store.create_schema(SchemaVersion::CURRENT).await?;
        let cluster_id = uuid::Uuid::new_v4().to_string();
        let mut txn = MetadataTxn::new();
        txn.put_cluster(&ClusterRecord {
            cluster_id: cluster_id.clone(),
            name: name.to_string(),
            topology_mode: if opts.multi_primary {
                TopologyMode::MultiPrimary
            } else {
                TopologyMode::SinglePrimary
            },
            group_name,
            primary_instance: (!opts.multi_primary).then(|| seed.to_string()),
            clusterset_id: None,
            attributes: Default::default(),
            created_at: timestamp_now(),
        })?;
        txn.put_instance(&InstanceRecord {
            instance_id: info.server_uuid.clone(),
            cluster_id,
            address: seed.to_string(),
            server_id: info.server_id,
            options: opts.member.to_instance_options(),
        })?;
        store.commit(txn).await?;

        tracing::info!("Cluster '{}' created on {}", name, seed);
        self.audit().log_event(
            AuditEventType::ClusterCreated,
            "orchestrator",
            Some(name.to_string()),
            format!("cluster bootstrapped on {}", seed),
            None,
        );
        Ok(())
    }

    // === rebootClusterFromCompleteOutage ===

    /// Restart a cluster whose members are all OFFLINE, from the member
    /// with the most complete history. Inside a ClusterSet, a cluster whose
    /// primary role was taken over by a failover is brought back fenced
    /// (`super_read_only`) and without touching metadata.
    pub async fn reboot_cluster_from_complete_outage(
        &self,
        entry: &str,
        name: Option<&str>,
        opts: RebootOptions,
    ) -> Result<OperationReport> {
        validate_address(entry)?;
        if let Some(name) = name {
            validate_name("cluster", name)?;
        }
        opts.validate()?;

        let local = self.read_metadata(entry).await?;
        let version = local
            .version
            .ok_or_else(|| Error::NotFound(format!("{} holds no cluster metadata", entry)))?;
        gate_version(version, false)?;
        let record = match name {
            Some(name) => local.cluster_by_name(name),
            None => local.cluster_of(entry),
        }
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("cluster of {}", entry)))?;
        let instances = local.instances_of(&record.cluster_id);

        let addresses: Vec<String> = instances.iter().map(|i| i.address.clone()).collect();
        let probes = self.probe_all(&addresses).await;
        let health = QuorumEvaluator::evaluate(&record.group_name, &instances, &probes);
        if health.quorum || health.view_size > 0 {
            return Err(Error::InvalidState(format!(
                "cluster '{}' is not in complete outage ({}); use forceQuorumUsingPartitionOf or rejoinInstance",
                record.name, health.status
            )));
        }
        let reachable: Vec<_> = probes.iter().filter_map(ProbeOutcome::result).collect();
        if reachable.is_empty() {
            return Err(Error::unreachable(entry, "no member of the cluster is reachable"));
        }

        let seed = match &opts.primary {
            Some(primary) => {
                if !addresses.contains(primary) {
                    return Err(Error::Argument(format!(
                        "{} is not a member of cluster '{}'",
                        primary, record.name
                    )));
                }
                let probe = reachable
                    .iter()
                    .find(|r| &r.address == primary)
                    .ok_or_else(|| Error::unreachable(primary, "requested primary is unreachable"))?;
                if let Some(ahead) = reachable
                    .iter()
                    .find(|r| !probe.gtid_executed.contains(&r.gtid_executed))
                {
                    return Err(Error::InvalidState(format!(
                        "{} has transactions missing on {}; reboot from {} instead",
                        ahead.address, primary, ahead.address
                    )));
                }
                *probe
            }
            None => {
                let mut candidates: Vec<_> = reachable
                    .iter()
                    .filter(|c| reachable.iter().all(|r| c.gtid_executed.contains(&r.gtid_executed)))
                    .collect();
                candidates.sort_by(|a, b| a.address.cmp(&b.address));
                **candidates.first().ok_or_else(|| {
                    Error::InvalidState(format!(
                        "members of cluster '{}' have diverged; no member contains every other member's transactions",
                        record.name
                    ))
                })?
            }
        }
        .clone();

        // ClusterSet role from the freshest reachable metadata
        let mut fenced = false;
        let mut superseded = false;
        let mut channel_source = None;
        let mut resolved = None;
        if record.clusterset_id.is_some() {
            let fresh = self.resolve_metadata(entry).await?;
            let set = fresh.clusterset().cloned();
            let role = fresh.snapshot.role_of(&record.cluster_id).cloned();
            if let Some(set) = set {
                if set.primary_cluster != record.cluster_id {
                    fenced = true;
                    superseded = role.map(|r| r.invalidated).unwrap_or(true)
                        || local
                            .clusterset(&set.clusterset_id)
                            .map(|s| s.primary_cluster == record.cluster_id)
                            .unwrap_or(false);
                    if !superseded {
                        channel_source = self
                            .cluster_view(&fresh.snapshot, &set.primary_cluster)
                            .await
                            .ok()
                            .and_then(|v| v.primary().map(String::from));
                    }
                }
            }
            resolved = Some(fresh);
        }

        let seed_instance = self.connect(&seed.address).await?;
        let mut locks = HeldLocks::new();
        if let Err(e) = self
            .lock(
                &mut locks,
                &seed_instance,
                &[(cluster_lock(&record.cluster_id), true)],
            )
            .await
        {
            locks.release().await;
            seed_instance.close().await;
            return Err(e);
        }
        let result = self
            .reboot_locked(
                &seed_instance,
                &record,
                &instances,
                &reachable.iter().map(|r| r.address.clone()).collect::<Vec<_>>(),
                fenced,
                superseded,
                channel_source.as_deref(),
                resolved.as_ref(),
            )
            .await;
        locks.release().await;
        seed_instance.close().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn reboot_locked(
        &self,
        seed: &Instance,
        record: &ClusterRecord,
        instances: &[InstanceRecord],
        reachable: &[String],
        fenced: bool,
        superseded: bool,
        channel_source: Option<&str>,
        resolved: Option<&ResolvedMetadata>,
    ) -> Result<OperationReport> {
        let mut report = OperationReport::new("rebootClusterFromCompleteOutage");
        let seed_address = seed.address().to_string();
        let multi_primary = record.topology_mode == TopologyMode::MultiPrimary;
        let options = |address: &str| {
            instances
                .iter()
                .find(|i| i.address == address)
                .map(|i| i.options.clone())
                .unwrap_or_default()
        };

        let seed_options = options(&seed_address);
        seed.execute(Statement::StartGroupReplication {
            group_name: record.group_name.clone(),
            bootstrap: true,
            multi_primary,
            seeds: vec![seed_address.clone()],
            member_weight: seed_options.member_weight,
            exit_state_action: seed_options.exit_state_action,
        })
        .await?;
        if fenced {
            seed.set_super_read_only(true).await?;
        }
        report.action(format!("bootstrap the group from {}", seed_address));

        let deadline = self.deadline();
        let group = record.group_name.as_str();
        self.wait_for_member("seed to come ONLINE", &seed_address, deadline, |r| {
            r.state == MemberState::Online && r.group_name.as_deref() == Some(group)
        })
        .await?;

        for address in reachable.iter().filter(|a| **a != seed_address) {
            let opts = options(address);
            let instance = self.connect(address).await?;
            let res = instance
                .execute(Statement::StartGroupReplication {
                    group_name: record.group_name.clone(),
                    bootstrap: false,
                    multi_primary,
                    seeds: vec![seed_address.clone()],
                    member_weight: opts.member_weight,
                    exit_state_action: opts.exit_state_action,
                })
                .await;
            instance.close().await;
            match res {
                Ok(_) => report.action(format!("rejoin {} to the group", address)),
                Err(e) => report.warn(format!("{} could not rejoin: {}", address, e)),
            }
        }
        for instance in instances.iter().filter(|i| !reachable.contains(&i.address)) {
            report.warn(format!(
                "{} was unreachable and was not rejoined; use rejoinInstance once it is back",
                instance.address
            ));
        }

        let view = self.probe_cluster(record, instances.to_vec()).await;
        let view = self
            .wait_for_cluster("rebooted members to come ONLINE", &view, deadline, |v| {
                v.health.quorum
                    && reachable.iter().all(|a| {
                        v.health
                            .member(a)
                            .map(|m| m.state == MemberClassification::Online)
                            .unwrap_or(true)
                    })
            })
            .await?;
        if multi_primary {
            let cluster = Cluster::new(self.clone(), &seed_address, &record.name);
            cluster.apply_auto_increment(&view, &mut report).await?;
        }

        if superseded {
            report.warn(format!(
                "cluster '{}' lost its primary role to a failover while it was down; it was left read-only (super_read_only) and must be rejoined with rejoinCluster",
                record.name
            ));
        } else if fenced {
            match (channel_source, view.primary()) {
                (Some(source), Some(primary)) => {
                    let cluster = Cluster::new(self.clone(), &seed_address, &record.name);
                    cluster
                        .move_clusterset_channel(None, primary, source, &mut report)
                        .await?;
                }
                _ => report.warn(
                    "the primary cluster is not reachable; the ClusterSet channel was not restored",
                ),
            }
        }

        if !superseded && record.topology_mode == TopologyMode::SinglePrimary {
            let new_primary = view.primary().map(String::from);
            if new_primary.is_some() && new_primary != record.primary_instance {
                let mut updated = record.clone();
                updated.primary_instance = new_primary;
                let mut txn = MetadataTxn::new();
                txn.put_cluster(&updated)?;
                let snapshot = resolved.map(|r| r.snapshot.clone());
                let writer = match &snapshot {
                    Some(snapshot) if fenced => {
                        let cluster = Cluster::new(self.clone(), &seed_address, &record.name);
                        cluster.metadata_writer(snapshot, &view).await
                    }
                    _ => view.require_available(),
                };
                match writer {
                    Ok(writer) => {
                        self.commit_metadata(&writer, txn).await?;
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
            "The cluster '{}' was rebooted from {}.",
            record.name, seed_address
        ));
        self.audit().log_event(
            AuditEventType::ClusterRebooted,
            "orchestrator",
            Some(record.name.clone()),
            format!("rebooted from {}", seed_address),
            Some(serde_json::json!({ "fenced": fenced, "superseded": superseded })),
        );
        Ok(report)
    }
}
