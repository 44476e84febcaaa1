//! Status aggregator
//!
//! Read-only and tolerant of partial failure. Starting from any reachable
//! member it reads that member's metadata, then visits the other clusters
//! of the ClusterSet and keeps the copy with the highest generation.
//!
//! Known limitation: when the current primary cluster cannot be reached
//! through any hop, the report shows the last primary recorded in the
//! freshest reachable copy and sets `stale`. Nothing stronger is possible
//! without contacting the unreachable cluster.

use crate::common::{Error, Result, SchemaVersion};
use crate::coordinator::{Cluster, ClusterSet, ClusterView, Orchestrator, ResolvedMetadata};
use crate::metadata::{gate_version, MetadataSnapshot};
use crate::topology::{
    ClusterRecord, ClusterRole, ClusterStatus, InstanceRole, MemberClassification, TopologyMode,
    CLUSTERSET_CHANNEL,
};
use crate::topology::session::ChannelRow;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashSet;

// === Metadata resolution ===

fn generation(snapshot: &MetadataSnapshot, clusterset_id: &str) -> u64 {
    snapshot
        .clusterset(clusterset_id)
        .map(|s| s.generation)
        .unwrap_or(0)
}

impl ResolvedMetadata {
    /// Apply the metadata version gate
    pub fn gate(&self, for_write: bool) -> Result<()> {
        let version = self
            .snapshot
            .version
            .ok_or_else(|| Error::NotFound(format!("no metadata on {}", self.source)))?;
        gate_version(version, for_write)
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterRecord> {
        self.snapshot
            .cluster_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("cluster '{}'", name)))
    }
}

impl Orchestrator {
    /// First readable metadata copy among a cluster's registered instances
    async fn read_cluster_metadata(
        &self,
        snapshot: &MetadataSnapshot,
        cluster: &ClusterRecord,
    ) -> Option<(MetadataSnapshot, String)> {
        for instance in snapshot.instances_of(&cluster.cluster_id) {
            match self.read_metadata(&instance.address).await {
                Ok(copy) if copy.version.is_some() => return Some((copy, instance.address)),
                Ok(_) => {}
                Err(e) => tracing::debug!("Cannot read metadata from {}: {}", instance.address, e),
            }
        }
        None
    }

    /// Resolve the freshest metadata reachable from `entry`
    pub(crate) async fn resolve_metadata(&self, entry: &str) -> Result<ResolvedMetadata> {
        let local = self.read_metadata(entry).await?;
        if local.version.is_none() {
            return Err(Error::NotFound(format!(
                "{} holds no cluster metadata",
                entry
            )));
        }

        let own = local.cluster_of(entry).cloned();
        let Some(set_id) = own.as_ref().and_then(|c| c.clusterset_id.clone()) else {
            return Ok(ResolvedMetadata {
                snapshot: local,
                source: entry.to_string(),
                stale: false,
                notes: Vec::new(),
            });
        };

        let mut visited: HashSet<String> = own.iter().map(|c| c.cluster_id.clone()).collect();
        let mut reached = visited.clone();
        let mut notes = Vec::new();
        let mut best = (local, entry.to_string());

        loop {
            let pending: Vec<ClusterRecord> = best
                .0
                .clusters_in(&set_id)
                .into_iter()
                .filter(|c| !visited.contains(&c.cluster_id))
                .filter(|c| {
                    !best
                        .0
                        .role_of(&c.cluster_id)
                        .map(|r| r.invalidated)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }

            let snapshot = best.0.clone();
            let reads = join_all(
                pending
                    .iter()
                    .map(|c| self.read_cluster_metadata(&snapshot, c)),
            )
            .await;

            for (cluster, read) in pending.iter().zip(reads) {
                visited.insert(cluster.cluster_id.clone());
                match read {
                    Some((copy, address)) => {
                        reached.insert(cluster.cluster_id.clone());
                        if generation(&copy, &set_id) > generation(&best.0, &set_id) {
                            tracing::debug!(
                                "Newer ClusterSet metadata (generation {}) found on {}",
                                generation(&copy, &set_id),
                                address
                            );
                            best = (copy, address);
                        }
                    }
                    None => notes.push(format!("cluster '{}' is unreachable", cluster.name)),
                }
            }
        }

        let (snapshot, source) = best;
        let primary_cluster = snapshot
            .clusterset(&set_id)
            .map(|s| s.primary_cluster.clone())
            .unwrap_or_default();
        let stale = !reached.contains(&primary_cluster);
        if stale {
            let name = snapshot
                .cluster_by_id(&primary_cluster)
                .map(|c| c.name.clone())
                .unwrap_or(primary_cluster);
            notes.push(format!(
                "primary cluster '{}' could not be reached; showing the last known ClusterSet state as recorded on {}",
                name, source
            ));
        }

        Ok(ResolvedMetadata {
            snapshot,
            source,
            stale,
            notes,
        })
    }
}

// === Cluster status ===

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub address: String,
    pub managed: bool,
    pub role: Option<InstanceRole>,
    /// `R/W`, `R/O` or `n/a`
    pub mode: String,
    pub status: MemberClassification,
    pub label: Option<String>,
    pub instance_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetMembership {
    pub domain: String,
    pub cluster_role: String,
    pub global_primary_instance: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatusReport {
    pub cluster_name: String,
    pub status: ClusterStatus,
    pub status_text: String,
    pub topology_mode: TopologyMode,
    pub primary: Option<String>,
    pub members: Vec<MemberStatus>,
    pub clusterset: Option<ClusterSetMembership>,
    pub metadata_version: Option<SchemaVersion>,
    pub metadata_source: String,
    pub stale: bool,
    pub notes: Vec<String>,
}

impl ClusterStatusReport {
    pub fn member(&self, address: &str) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.address == address)
    }
}

fn member_statuses(view: &ClusterView, replica_of: Option<&str>) -> Vec<MemberStatus> {
    let primary = view.primary();
    view.health
        .members
        .iter()
        .map(|m| {
            let probe = view.probe(&m.address);
            let mut errors = Vec::new();
            if !m.registered {
                errors.push(
                    "member of the group but not managed in metadata; use rescan to add it".into(),
                );
            }
            if m.state == MemberClassification::Missing {
                errors.push(
                    "not part of the group; use rejoinInstance or removeInstance".to_string(),
                );
            }
            let mode = match (probe, m.state) {
                (Some(p), MemberClassification::Online) if !p.super_read_only => "R/W",
                (Some(_), MemberClassification::Online) => "R/O",
                _ => "n/a",
            };
            if let (Some(source), Some(p)) = (replica_of, probe) {
                if Some(m.address.as_str()) == primary {
                    match p.channel(CLUSTERSET_CHANNEL) {
                        Some(c) if c.is_running() && c.source.as_deref() == Some(source) => {}
                        Some(c) if c.is_running() => errors.push(format!(
                            "ClusterSet channel replicates from {} instead of {}",
                            c.source.as_deref().unwrap_or("?"),
                            source
                        )),
                        Some(c) => errors.push(format!(
                            "ClusterSet channel is stopped{}",
                            c.last_error
                                .as_ref()
                                .map(|e| format!(": {}", e))
                                .unwrap_or_default()
                        )),
                        None => errors.push("ClusterSet channel is not configured".into()),
                    }
                }
            }
            MemberStatus {
                address: m.address.clone(),
                managed: m.registered,
                role: m.role,
                mode: mode.to_string(),
                status: m.state,
                label: view
                    .registered(&m.address)
                    .and_then(|i| i.options.label.clone()),
                instance_errors: errors,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceDescription {
    pub address: String,
    pub server_id: u32,
    pub label: Option<String>,
    pub member_weight: Option<u8>,
}

/// Metadata-only description of a cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDescription {
    pub cluster_name: String,
    pub topology_mode: TopologyMode,
    pub clusterset_domain: Option<String>,
    pub instances: Vec<InstanceDescription>,
}

impl Cluster {
    /// Live status of the cluster and its members
    pub async fn status(&self) -> Result<ClusterStatusReport> {
        let resolved = self.orch.resolve_metadata(&self.entry).await?;
        resolved.gate(false)?;
        let record = resolved.cluster(&self.name)?.clone();
        let view = self
            .orch
            .probe_cluster(&record, resolved.snapshot.instances_of(&record.cluster_id))
            .await;

        let mut clusterset = None;
        let mut replica_of = None;
        if let Some(set) = record
            .clusterset_id
            .as_deref()
            .and_then(|id| resolved.snapshot.clusterset(id))
        {
            let role = resolved.snapshot.role_of(&record.cluster_id);
            let global_primary = if set.primary_cluster == record.cluster_id {
                view.primary().map(String::from)
            } else {
                let primary_record = resolved.snapshot.cluster_by_id(&set.primary_cluster);
                match primary_record {
                    Some(p) => self
                        .orch
                        .probe_cluster(p, resolved.snapshot.instances_of(&p.cluster_id))
                        .await
                        .primary()
                        .map(String::from),
                    None => None,
                }
            };
            if role.map(|r| r.role == ClusterRole::Replica && !r.invalidated) == Some(true) {
                replica_of = global_primary.clone();
            }
            clusterset = Some(ClusterSetMembership {
                domain: set.domain.clone(),
                cluster_role: role.map(|r| r.display_role()).unwrap_or_default(),
                global_primary_instance: global_primary,
            });
        }

        Ok(ClusterStatusReport {
            cluster_name: record.name.clone(),
            status: view.health.status,
            status_text: view.health.status_text(),
            topology_mode: match view.health.multi_primary {
                Some(true) => TopologyMode::MultiPrimary,
                Some(false) => TopologyMode::SinglePrimary,
                None => record.topology_mode,
            },
            primary: view.primary().map(String::from),
            members: member_statuses(&view, replica_of.as_deref()),
            clusterset,
            metadata_version: resolved.snapshot.version,
            metadata_source: resolved.source.clone(),
            stale: resolved.stale,
            notes: resolved.notes.clone(),
        })
    }

    /// Cluster structure as recorded in metadata, without probing
    pub async fn describe(&self) -> Result<ClusterDescription> {
        let resolved = self.orch.resolve_metadata(&self.entry).await?;
        resolved.gate(false)?;
        let record = resolved.cluster(&self.name)?;
        Ok(ClusterDescription {
            cluster_name: record.name.clone(),
            topology_mode: record.topology_mode,
            clusterset_domain: record
                .clusterset_id
                .as_deref()
                .and_then(|id| resolved.snapshot.clusterset(id))
                .map(|s| s.domain.clone()),
            instances: resolved
                .snapshot
                .instances_of(&record.cluster_id)
                .into_iter()
                .map(|i| InstanceDescription {
                    address: i.address,
                    server_id: i.server_id,
                    label: i.options.label,
                    member_weight: i.options.member_weight,
                })
                .collect(),
        })
    }
}

// === ClusterSet status ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterSetGlobalStatus {
    /// Every cluster is OK
    Healthy,
    /// The primary cluster is OK, some replica is not
    Available,
    /// The primary cluster cannot accept writes
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterGlobalStatus {
    Ok,
    OkNotReplicating,
    OkNotConsistent,
    NotOk,
    Invalidated,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetMemberStatus {
    pub cluster_name: String,
    pub cluster_role: String,
    pub global_status: ClusterGlobalStatus,
    pub status: ClusterStatus,
    pub primary: Option<String>,
    pub channel: Option<ChannelRow>,
    /// Transactions this cluster has that the global primary lacks
    pub errant_transactions: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetStatus {
    pub domain: String,
    pub primary_cluster: String,
    pub global_primary_instance: Option<String>,
    pub generation: u64,
    pub status: ClusterSetGlobalStatus,
    pub status_text: String,
    pub clusters: Vec<ClusterSetMemberStatus>,
    pub metadata_source: String,
    pub stale: bool,
    pub notes: Vec<String>,
}

impl ClusterSetStatus {
    pub fn cluster(&self, name: &str) -> Option<&ClusterSetMemberStatus> {
        self.clusters.iter().find(|c| c.cluster_name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetClusterDescription {
    pub cluster_name: String,
    pub cluster_role: String,
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSetDescription {
    pub domain: String,
    pub primary_cluster: String,
    pub generation: u64,
    pub clusters: Vec<ClusterSetClusterDescription>,
}

impl ClusterSet {
    pub async fn status(&self) -> Result<ClusterSetStatus> {
        let (resolved, set) = self.resolve(false).await?;
        let snapshot = &resolved.snapshot;
        let records: Vec<ClusterRecord> = snapshot
            .clusters_in(&set.clusterset_id)
            .into_iter()
            .cloned()
            .collect();
        let views: Vec<ClusterView> = join_all(
            records
                .iter()
                .map(|c| self.orch.probe_cluster(c, snapshot.instances_of(&c.cluster_id))),
        )
        .await;

        let primary_view = views
            .iter()
            .find(|v| v.record.cluster_id == set.primary_cluster);
        let global_primary = primary_view.and_then(|v| v.primary_probe());

        let mut clusters = Vec::new();
        for view in &views {
            let role = snapshot.role_of(&view.record.cluster_id);
            let is_primary = view.record.cluster_id == set.primary_cluster;
            let invalidated = role.map(|r| r.invalidated).unwrap_or(false);
            let probe = view.primary_probe();
            let channel = probe.and_then(|p| p.channel(CLUSTERSET_CHANNEL)).cloned();
            let errant = match (probe, global_primary) {
                (Some(p), Some(g)) if !is_primary => {
                    let extra = p.gtid_executed.subtract(&g.gtid_executed);
                    (!extra.is_empty()).then(|| extra.to_string())
                }
                _ => None,
            };

            let global_status = if invalidated {
                ClusterGlobalStatus::Invalidated
            } else if view.health.status == ClusterStatus::Unknown {
                ClusterGlobalStatus::Unknown
            } else if !view.is_available() {
                ClusterGlobalStatus::NotOk
            } else if is_primary {
                ClusterGlobalStatus::Ok
            } else if errant.is_some() {
                ClusterGlobalStatus::OkNotConsistent
            } else {
                let expected = global_primary.map(|g| g.address.as_str());
                match &channel {
                    Some(c) if c.is_running() && c.source.as_deref() == expected => {
                        ClusterGlobalStatus::Ok
                    }
                    _ => ClusterGlobalStatus::OkNotReplicating,
                }
            };

            clusters.push(ClusterSetMemberStatus {
                cluster_name: view.record.name.clone(),
                cluster_role: role
                    .map(|r| r.display_role())
                    .unwrap_or_else(|| "UNKNOWN".into()),
                global_status,
                status: view.health.status,
                primary: view.primary().map(String::from),
                channel: if is_primary { None } else { channel },
                errant_transactions: errant,
            });
        }

        let primary_ok = clusters
            .iter()
            .zip(&views)
            .any(|(c, v)| {
                v.record.cluster_id == set.primary_cluster
                    && c.global_status == ClusterGlobalStatus::Ok
            });
        let all_ok = clusters
            .iter()
            .all(|c| c.global_status == ClusterGlobalStatus::Ok);
        let (status, status_text) = match (primary_ok, all_ok) {
            (true, true) => (
                ClusterSetGlobalStatus::Healthy,
                "All Clusters available.".to_string(),
            ),
            (true, false) => (
                ClusterSetGlobalStatus::Available,
                "Primary Cluster available, there are issues with a Replica cluster.".to_string(),
            ),
            (false, _) => (
                ClusterSetGlobalStatus::Unavailable,
                "Primary Cluster is not available. ClusterSet availability may be restored by \
                 restoring the Primary Cluster or failing over."
                    .to_string(),
            ),
        };

        Ok(ClusterSetStatus {
            domain: set.domain.clone(),
            primary_cluster: snapshot
                .cluster_by_id(&set.primary_cluster)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| set.primary_cluster.clone()),
            global_primary_instance: global_primary.map(|g| g.address.clone()),
            generation: set.generation,
            status,
            status_text,
            clusters,
            metadata_source: resolved.source.clone(),
            stale: resolved.stale,
            notes: resolved.notes.clone(),
        })
    }

    /// ClusterSet structure as recorded in metadata, without probing
    pub async fn describe(&self) -> Result<ClusterSetDescription> {
        let (resolved, set) = self.resolve(false).await?;
        let snapshot = &resolved.snapshot;
        Ok(ClusterSetDescription {
            domain: set.domain.clone(),
            primary_cluster: snapshot
                .cluster_by_id(&set.primary_cluster)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| set.primary_cluster.clone()),
            generation: set.generation,
            clusters: snapshot
                .clusters_in(&set.clusterset_id)
                .into_iter()
                .map(|c| ClusterSetClusterDescription {
                    cluster_name: c.name.clone(),
                    cluster_role: snapshot
                        .role_of(&c.cluster_id)
                        .map(|r| r.display_role())
                        .unwrap_or_default(),
                    instances: snapshot
                        .instances_of(&c.cluster_id)
                        .into_iter()
                        .map(|i| i.address)
                        .collect(),
                })
                .collect(),
        })
    }
}
