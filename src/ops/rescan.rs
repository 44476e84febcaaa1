//! Reconcile cluster metadata with the consensus view

use crate::common::{AuditEventType, Result};
use crate::coordinator::options::RescanOptions;
use crate::coordinator::report::OperationReport;
use crate::coordinator::Cluster;
use crate::metadata::MetadataTxn;
use crate::topology::{InstanceOptions, InstanceRecord, TopologyMode};
use serde::Serialize;

/// Differences between metadata and the group, before any fix
#[derive(Debug, Clone, Default, Serialize)]
pub struct RescanFindings {
    /// In the group view but not registered
    pub unmanaged: Vec<String>,
    /// Registered but no longer part of the group view
    pub obsolete: Vec<String>,
    /// Mode the group actually runs in, when metadata disagrees
    pub mode: Option<TopologyMode>,
    /// Primary the group actually has, when metadata disagrees
    pub primary: Option<String>,
}

impl RescanFindings {
    pub fn is_clean(&self) -> bool {
        self.unmanaged.is_empty()
            && self.obsolete.is_empty()
            && self.mode.is_none()
            && self.primary.is_none()
    }
}

impl Cluster {
    /// Bring metadata in line with the group after changes made outside
    /// the orchestrator, or after an operation failed between its physical
    /// change and its metadata commit.
    pub async fn rescan(&self, opts: RescanOptions) -> Result<OperationReport> {
        let ctx = self.context(true).await?;
        ctx.view.require_available()?;
        let writer = self.metadata_writer(ctx.snapshot(), &ctx.view).await?;

        let locks = self.lock_cluster(&ctx).await?;
        let result = async {
            let view = self.revalidate(&ctx.view).await?;
            let health = &view.health;
            let mut report = OperationReport::new("rescan");

            let mut findings = RescanFindings {
                unmanaged: health.unmanaged().map(|m| m.address.clone()).collect(),
                obsolete: health
                    .members
                    .iter()
                    .filter(|m| m.registered && !m.in_view)
                    .map(|m| m.address.clone())
                    .collect(),
                ..Default::default()
            };
            let actual_mode = match health.multi_primary {
                Some(true) => TopologyMode::MultiPrimary,
                _ => TopologyMode::SinglePrimary,
            };
            if actual_mode != view.record.topology_mode {
                findings.mode = Some(actual_mode);
            }
            let actual_primary = match actual_mode {
                TopologyMode::SinglePrimary => health.primary.clone(),
                TopologyMode::MultiPrimary => None,
            };
            if actual_primary != view.record.primary_instance && actual_primary.is_some() {
                findings.primary = actual_primary.clone();
            }
            tracing::debug!("Rescan of cluster '{}': {:?}", self.name, findings);

            let mut txn = MetadataTxn::new();

            for address in &findings.unmanaged {
                if !opts.add_unmanaged {
                    report.warn(format!(
                        "{} is part of the group but not managed by cluster '{}'; rescan with addUnmanaged to add it",
                        address, self.name
                    ));
                    continue;
                }
                let Some(probe) = view.probe(address) else {
                    report.warn(format!("{} is unreachable and was not added", address));
                    continue;
                };
                txn.put_instance(&InstanceRecord {
                    instance_id: probe.server_uuid.clone(),
                    cluster_id: view.record.cluster_id.clone(),
                    address: address.clone(),
                    server_id: probe.server_id,
                    options: InstanceOptions {
                        label: Some(address.clone()),
                        ..Default::default()
                    },
                })?;
                report.action(format!("register {} in metadata", address));
            }

            for address in &findings.obsolete {
                if !opts.remove_obsolete {
                    report.warn(format!(
                        "{} is registered but no longer part of the group; rescan with removeObsolete to remove it",
                        address
                    ));
                    continue;
                }
                if let Some(record) = view.registered(address) {
                    txn.delete_instance(&record.instance_id);
                    report.action(format!("remove {} from metadata", address));
                }
            }

            if findings.mode.is_some() || findings.primary.is_some() {
                let mut record = view.record.clone();
                record.topology_mode = actual_mode;
                record.primary_instance = actual_primary;
                txn.put_cluster(&record)?;
                if let Some(mode) = findings.mode {
                    report.action(format!("record topology mode {}", mode));
                }
                if let Some(primary) = &findings.primary {
                    report.action(format!("record {} as the primary", primary));
                }
            }

            self.orch.commit_metadata(&writer, txn).await?;

            if findings.is_clean() {
                report.info(format!(
                    "Metadata of cluster '{}' matches the group; nothing to do.",
                    self.name
                ));
            } else {
                report.info(format!("Rescan of cluster '{}' finished.", self.name));
            }
            self.orch.audit().log_event(
                AuditEventType::ClusterRescanned,
                "orchestrator",
                Some(self.name.clone()),
                format!("{} change(s)", report.actions.len()),
                serde_json::to_value(&findings).ok(),
            );
            Ok(report)
        }
        .await;
        locks.release().await;
        result
    }
}
