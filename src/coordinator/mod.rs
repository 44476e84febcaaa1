//! Orchestrator: every administrative operation on clusters and ClusterSets
//!
//! Each operation runs on the caller's task and follows the same shape:
//! - load metadata and probe the members concurrently
//! - evaluate quorum and validate every precondition (nothing is mutated
//!   before planning succeeds)
//! - take the advisory locks, then re-validate quorum
//! - perform the physical change and confirm it by re-probing
//! - commit metadata last, so a crash leaves metadata behind reality,
//!   never ahead of it
//!
//! Handles ([`Cluster`], [`ClusterSet`]) remember only names and an entry
//! address. The primary is re-read from metadata and probes on every call.

pub mod cluster;
pub mod clusterset;
pub mod election;
pub mod failover;
pub mod options;
pub mod rejoin;
pub mod report;
pub mod status;
pub mod upgrade;

pub use cluster::Cluster;
pub use clusterset::ClusterSet;
pub use options::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, FailoverOptions, MemberOptions,
    RebootOptions, RecoveryMethod, RejoinClusterOptions, RejoinInstanceOptions,
    RemoveClusterOptions, RemoveInstanceOptions, ReplicaClusterOptions, RescanOptions,
    SetPrimaryInstanceOptions, SwitchoverOptions, UpgradeMetadataOptions,
};
pub use report::OperationReport;
pub use status::{
    ClusterDescription, ClusterGlobalStatus, ClusterSetDescription, ClusterSetGlobalStatus,
    ClusterSetStatus, ClusterStatusReport, MemberStatus,
};

use crate::common::{poll_until, AuditLogger, Deadline, Error, OrchestratorConfig, Result};
use crate::metadata::{HeldLocks, MetadataSnapshot, MetadataStore, MetadataTxn};
use crate::topology::{
    ClusterHealth, ClusterRecord, ClusterSetRecord, Instance, InstanceRecord, MemberProbe,
    ProbeOutcome, ProbeResult, QuorumEvaluator, SessionProvider,
};
use std::future::Future;
use std::sync::Arc;

struct OrchestratorInner {
    provider: Arc<dyn SessionProvider>,
    config: OrchestratorConfig,
    probe: MemberProbe,
    audit: AuditLogger,
}

/// Entry point of the control API. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn SessionProvider>, config: OrchestratorConfig) -> Self {
        let audit = match &config.audit_log {
            Some(path) => AuditLogger::new(path),
            None => AuditLogger::disabled(),
        };
        Self::with_audit(provider, config, audit)
    }

    pub fn with_audit(
        provider: Arc<dyn SessionProvider>,
        config: OrchestratorConfig,
        audit: AuditLogger,
    ) -> Self {
        let probe = MemberProbe::new(config.probe_timeout());
        Self {
            inner: Arc::new(OrchestratorInner {
                provider,
                config,
                probe,
                audit,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub(crate) fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    /// Budget for one operation, starting now
    pub(crate) fn deadline(&self) -> Deadline {
        Deadline::after(self.inner.config.operation_timeout())
    }

    pub(crate) async fn connect(&self, address: &str) -> Result<Instance> {
        Instance::connect(
            self.inner.provider.as_ref(),
            address,
            self.inner.config.probe_timeout(),
        )
        .await
    }

    pub(crate) async fn probe(&self, address: &str) -> ProbeOutcome {
        self.inner
            .probe
            .probe(self.inner.provider.as_ref(), address)
            .await
    }

    pub(crate) async fn probe_all(&self, addresses: &[String]) -> Vec<ProbeOutcome> {
        self.inner
            .probe
            .probe_all(self.inner.provider.as_ref(), addresses)
            .await
    }

    /// Probe every registered member of `record`, plus any member of the
    /// consensus view that metadata does not know about.
    pub(crate) async fn probe_cluster(
        &self,
        record: &ClusterRecord,
        instances: Vec<InstanceRecord>,
    ) -> ClusterView {
        let addresses: Vec<String> = instances.iter().map(|i| i.address.clone()).collect();
        let mut probes = self.probe_all(&addresses).await;
        let mut health = QuorumEvaluator::evaluate(&record.group_name, &instances, &probes);

        let unmanaged: Vec<String> = health
            .unmanaged()
            .map(|m| m.address.clone())
            .filter(|a| !addresses.contains(a))
            .collect();
        if !unmanaged.is_empty() {
            probes.extend(self.probe_all(&unmanaged).await);
            health = QuorumEvaluator::evaluate(&record.group_name, &instances, &probes);
        }

        ClusterView {
            record: record.clone(),
            instances,
            probes,
            health,
        }
    }

    /// Re-probe a cluster using the same registered instance list
    pub(crate) async fn reprobe(&self, view: &ClusterView) -> ClusterView {
        self.probe_cluster(&view.record, view.instances.clone()).await
    }

    /// Probe a cluster known to `snapshot` by id
    pub(crate) async fn cluster_view(
        &self,
        snapshot: &MetadataSnapshot,
        cluster_id: &str,
    ) -> Result<ClusterView> {
        let record = snapshot
            .cluster_by_id(cluster_id)
            .ok_or_else(|| Error::MetadataCorrupted(format!("unknown cluster id {}", cluster_id)))?;
        Ok(self
            .probe_cluster(record, snapshot.instances_of(cluster_id))
            .await)
    }

    /// Re-probe until `done` holds for the cluster view
    pub(crate) async fn wait_for_cluster<P>(
        &self,
        what: &str,
        view: &ClusterView,
        deadline: Deadline,
        done: P,
    ) -> Result<ClusterView>
    where
        P: Fn(&ClusterView) -> bool,
    {
        let done = &done;
        self.wait_for(what, deadline, move || async move {
            let fresh = self.reprobe(view).await;
            Ok(done(&fresh).then_some(fresh))
        })
        .await
    }

    /// Re-probe one instance until `done` holds
    pub(crate) async fn wait_for_member<P>(
        &self,
        what: &str,
        address: &str,
        deadline: Deadline,
        done: P,
    ) -> Result<ProbeResult>
    where
        P: Fn(&ProbeResult) -> bool,
    {
        let done = &done;
        self.wait_for(what, deadline, move || async move {
            Ok(match self.probe(address).await {
                ProbeOutcome::Reachable(r) if done(&r) => Some(r),
                _ => None,
            })
        })
        .await
    }

    /// Read the metadata stored on one instance
    pub(crate) async fn read_metadata(&self, address: &str) -> Result<MetadataSnapshot> {
        let instance = self.connect(address).await?;
        let snapshot = MetadataStore::new(instance.clone()).load().await;
        instance.close().await;
        snapshot
    }

    /// Commit a metadata transaction through `address`
    pub(crate) async fn commit_metadata(&self, address: &str, txn: MetadataTxn) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let instance = self.connect(address).await?;
        let result = MetadataStore::new(instance.clone()).commit(txn).await;
        instance.close().await;
        result
    }

    /// Re-probe until `check` yields a value or the deadline passes
    pub(crate) async fn wait_for<F, Fut, T>(
        &self,
        what: &str,
        deadline: Deadline,
        check: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        poll_until(what, deadline, self.inner.config.poll_interval(), check).await
    }

    /// Take every `(name, exclusive)` lock on `instance`. Conflicts are
    /// retried for the configured lock timeout, then reported.
    pub(crate) async fn lock(
        &self,
        locks: &mut HeldLocks,
        instance: &Instance,
        names: &[(String, bool)],
    ) -> Result<()> {
        let wait = self.inner.config.lock_timeout();
        for (name, exclusive) in names {
            let deadline = Deadline::after(wait);
            loop {
                match locks.acquire(instance, name, *exclusive).await {
                    Ok(()) => break,
                    Err(Error::Conflict(msg)) if !deadline.expired() => {
                        tracing::debug!("{}; retrying", msg);
                        tokio::time::sleep(
                            self.inner.config.poll_interval().min(deadline.remaining()),
                        )
                        .await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Handle to the cluster `entry` belongs to, or to the cluster called
    /// `name` in the metadata reachable through `entry`.
    pub async fn get_cluster(&self, entry: &str, name: Option<&str>) -> Result<Cluster> {
        crate::common::validate_address(entry)?;
        let resolved = self.resolve_metadata(entry).await?;
        resolved.gate(false)?;
        let record = match name {
            Some(name) => resolved
                .snapshot
                .cluster_by_name(name)
                .ok_or_else(|| Error::NotFound(format!("cluster '{}'", name)))?,
            None => resolved
                .snapshot
                .cluster_of(entry)
                .ok_or_else(|| Error::NotFound(format!("no cluster contains {}", entry)))?,
        };
        Ok(Cluster::new(self.clone(), entry, &record.name))
    }

    /// Handle to the ClusterSet the cluster of `entry` belongs to
    pub async fn get_clusterset(&self, entry: &str) -> Result<ClusterSet> {
        crate::common::validate_address(entry)?;
        let resolved = self.resolve_metadata(entry).await?;
        resolved.gate(false)?;
        let set = resolved
            .clusterset()
            .ok_or_else(|| Error::InvalidState(format!("{} is not part of a ClusterSet", entry)))?;
        Ok(ClusterSet::new(self.clone(), entry, &set.domain))
    }
}

/// One cluster as seen by one operation: metadata plus live probes
#[derive(Debug, Clone)]
pub(crate) struct ClusterView {
    pub record: ClusterRecord,
    pub instances: Vec<InstanceRecord>,
    pub probes: Vec<ProbeOutcome>,
    pub health: ClusterHealth,
}

impl ClusterView {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn probe(&self, address: &str) -> Option<&ProbeResult> {
        self.probes
            .iter()
            .find(|p| p.address() == address)
            .and_then(ProbeOutcome::result)
    }

    pub fn registered(&self, address: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.address == address)
    }

    /// Addresses of the reachable ONLINE members, sorted
    pub fn online(&self) -> Vec<String> {
        let mut out: Vec<String> = self.health.online().map(|m| m.address.clone()).collect();
        out.sort();
        out
    }

    /// The writable member: the primary in single-primary mode, the first
    /// ONLINE member in multi-primary mode
    pub fn primary(&self) -> Option<&str> {
        if !self.health.quorum {
            return None;
        }
        match self.health.multi_primary {
            Some(true) => self
                .health
                .online()
                .map(|m| m.address.as_str())
                .min(),
            _ => self
                .health
                .primary
                .as_deref()
                .filter(|p| self.probe(p).is_some()),
        }
    }

    pub fn primary_probe(&self) -> Option<&ProbeResult> {
        self.primary().and_then(|p| self.probe(p))
    }

    pub fn require_quorum(&self) -> Result<()> {
        if self.health.quorum {
            Ok(())
        } else {
            Err(Error::no_quorum(
                self.name(),
                format!("{}: {}", self.health.status, self.health.status_text()),
            ))
        }
    }

    /// Quorum plus a reachable primary
    pub fn require_available(&self) -> Result<String> {
        self.require_quorum()?;
        self.primary().map(String::from).ok_or_else(|| {
            Error::InvalidState(format!("cluster '{}' has no reachable primary", self.name()))
        })
    }

    pub fn is_available(&self) -> bool {
        self.primary().is_some()
    }
}

/// Metadata resolved for one operation
#[derive(Debug, Clone)]
pub(crate) struct ResolvedMetadata {
    pub snapshot: MetadataSnapshot,
    /// Instance the snapshot was read from
    pub source: String,
    /// The primary cluster of the ClusterSet could not be reached
    pub stale: bool,
    pub notes: Vec<String>,
}

impl ResolvedMetadata {
    pub fn clusterset(&self) -> Option<&ClusterSetRecord> {
        self.snapshot.clustersets.first()
    }
}
