//! Topology metadata store
//!
//! The metadata lives inside the managed database itself, replicated to every
//! member like any other schema. A [`MetadataStore`] reads and writes it
//! through one [`Instance`]; writes are buffered in a [`MetadataTxn`] and
//! committed atomically.

use crate::common::{Error, Result, SchemaVersion};
use crate::metadata::schema::{
    MarkerRow, MetadataTable, MetadataWrite, RecordRow, SchemaKind, SchemaRow, UpgradeState,
};
use crate::topology::instance::Instance;
use crate::topology::model::{ClusterRecord, ClusterRoleRecord, ClusterSetRecord, InstanceRecord};
use crate::topology::session::{decode_rows, Statement};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Everything the metadata schema holds, as read at one point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataSnapshot {
    pub version: Option<SchemaVersion>,
    pub clusters: Vec<ClusterRecord>,
    pub instances: Vec<InstanceRecord>,
    pub clustersets: Vec<ClusterSetRecord>,
    pub roles: Vec<ClusterRoleRecord>,
}

impl MetadataSnapshot {
    pub fn cluster_by_name(&self, name: &str) -> Option<&ClusterRecord> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn cluster_by_id(&self, cluster_id: &str) -> Option<&ClusterRecord> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    pub fn instance_by_address(&self, address: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.address == address)
    }

    /// Cluster an instance is registered in
    pub fn cluster_of(&self, address: &str) -> Option<&ClusterRecord> {
        self.instance_by_address(address)
            .and_then(|i| self.cluster_by_id(&i.cluster_id))
    }

    /// Registered instances of a cluster, ordered by address
    pub fn instances_of(&self, cluster_id: &str) -> Vec<InstanceRecord> {
        let mut out: Vec<InstanceRecord> = self
            .instances
            .iter()
            .filter(|i| i.cluster_id == cluster_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    pub fn clusterset(&self, clusterset_id: &str) -> Option<&ClusterSetRecord> {
        self.clustersets
            .iter()
            .find(|s| s.clusterset_id == clusterset_id)
    }

    pub fn role_of(&self, cluster_id: &str) -> Option<&ClusterRoleRecord> {
        self.roles.iter().find(|r| r.cluster_id == cluster_id)
    }

    /// Member clusters of a ClusterSet, primary first, then by name
    pub fn clusters_in(&self, clusterset_id: &str) -> Vec<&ClusterRecord> {
        let primary = self.clusterset(clusterset_id).map(|s| s.primary_cluster.as_str());
        let mut out: Vec<&ClusterRecord> = self
            .clusters
            .iter()
            .filter(|c| c.clusterset_id.as_deref() == Some(clusterset_id))
            .collect();
        out.sort_by(|a, b| {
            let ap = Some(a.cluster_id.as_str()) == primary;
            let bp = Some(b.cluster_id.as_str()) == primary;
            bp.cmp(&ap).then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// Buffered metadata changes, committed as one transaction
#[derive(Debug, Clone, Default)]
pub struct MetadataTxn {
    writes: Vec<MetadataWrite>,
}

impl MetadataTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[MetadataWrite] {
        &self.writes
    }

    fn upsert<T: Serialize>(&mut self, table: MetadataTable, key: &str, record: &T) -> Result<()> {
        self.writes.push(MetadataWrite::Upsert {
            table,
            key: key.to_string(),
            record: serde_json::to_value(record)?,
        });
        Ok(())
    }

    fn delete(&mut self, table: MetadataTable, key: &str) {
        self.writes.push(MetadataWrite::Delete {
            table,
            key: key.to_string(),
        });
    }

    pub fn put_cluster(&mut self, record: &ClusterRecord) -> Result<()> {
        self.upsert(MetadataTable::Clusters, &record.cluster_id, record)
    }

    pub fn delete_cluster(&mut self, cluster_id: &str) {
        self.delete(MetadataTable::Clusters, cluster_id)
    }

    pub fn put_instance(&mut self, record: &InstanceRecord) -> Result<()> {
        self.upsert(MetadataTable::Instances, &record.instance_id, record)
    }

    pub fn delete_instance(&mut self, instance_id: &str) {
        self.delete(MetadataTable::Instances, instance_id)
    }

    pub fn put_clusterset(&mut self, record: &ClusterSetRecord) -> Result<()> {
        self.upsert(MetadataTable::ClusterSets, &record.clusterset_id, record)
    }

    pub fn delete_clusterset(&mut self, clusterset_id: &str) {
        self.delete(MetadataTable::ClusterSets, clusterset_id)
    }

    pub fn put_role(&mut self, record: &ClusterRoleRecord) -> Result<()> {
        self.upsert(MetadataTable::ClusterRoles, &record.cluster_id, record)
    }

    pub fn delete_role(&mut self, cluster_id: &str) {
        self.delete(MetadataTable::ClusterRoles, cluster_id)
    }
}

/// Versions of the live and backup schemas as found on one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaVersions {
    pub live: Option<SchemaVersion>,
    pub backup: Option<SchemaVersion>,
}

/// Metadata access through one instance
#[derive(Debug, Clone)]
pub struct MetadataStore {
    instance: Instance,
}

impl MetadataStore {
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    // === Schema ===

    pub async fn schema_versions(&self) -> Result<SchemaVersions> {
        let rows: Vec<SchemaRow> =
            decode_rows(self.instance.execute(Statement::QueryMetadataSchemas).await?)?;
        let mut versions = SchemaVersions::default();
        for row in rows {
            match row.schema {
                SchemaKind::Live => versions.live = Some(row.version),
                SchemaKind::Backup => versions.backup = Some(row.version),
            }
        }
        Ok(versions)
    }

    /// Version of the live schema, `None` when the instance has no metadata
    pub async fn installed_version(&self) -> Result<Option<SchemaVersion>> {
        Ok(self.schema_versions().await?.live)
    }

    /// Refuse to operate on metadata that is mid-upgrade or newer than this
    /// build understands. Older versions are readable but not writable.
    pub async fn check_version(&self, for_write: bool) -> Result<SchemaVersion> {
        let version = self.installed_version().await?.ok_or_else(|| {
            Error::NotFound(format!(
                "no metadata schema on {}",
                self.instance.address()
            ))
        })?;
        gate_version(version, for_write)?;
        Ok(version)
    }

    pub async fn create_schema(&self, version: SchemaVersion) -> Result<()> {
        self.instance
            .execute(Statement::CreateMetadataSchema { version })
            .await?;
        Ok(())
    }

    pub async fn drop_schema(&self) -> Result<()> {
        self.instance.execute(Statement::DropMetadataSchema).await?;
        Ok(())
    }

    pub async fn set_version(&self, version: SchemaVersion) -> Result<()> {
        self.instance
            .execute(Statement::SetMetadataVersion { version })
            .await?;
        Ok(())
    }

    // === Upgrade bookkeeping ===

    pub async fn upgrade_marker(&self) -> Result<Option<UpgradeState>> {
        let rows: Vec<MarkerRow> =
            decode_rows(self.instance.execute(Statement::QueryUpgradeMarker).await?)?;
        Ok(rows.into_iter().next().map(|r| r.state))
    }

    pub async fn set_upgrade_marker(&self, state: Option<UpgradeState>) -> Result<()> {
        self.instance
            .execute(Statement::SetUpgradeMarker { state })
            .await?;
        Ok(())
    }

    pub async fn backup(&self) -> Result<()> {
        self.instance.execute(Statement::BackupMetadataSchema).await?;
        Ok(())
    }

    pub async fn restore_backup(&self) -> Result<()> {
        self.instance.execute(Statement::RestoreMetadataSchema).await?;
        Ok(())
    }

    pub async fn drop_backup(&self) -> Result<()> {
        self.instance.execute(Statement::DropMetadataBackup).await?;
        Ok(())
    }

    pub async fn migrate(&self, from: SchemaVersion, to: SchemaVersion) -> Result<()> {
        self.instance
            .execute(Statement::MigrateMetadataSchema { from, to })
            .await?;
        Ok(())
    }

    // === Records ===

    async fn select<T: DeserializeOwned>(&self, table: MetadataTable) -> Result<Vec<T>> {
        let rows: Vec<RecordRow> =
            decode_rows(self.instance.execute(Statement::MetadataSelect { table }).await?)?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row.record).map_err(|e| {
                    Error::MetadataCorrupted(format!("{} row '{}': {}", table, row.key, e))
                })
            })
            .collect()
    }

    /// Read every table. Does not check the schema version.
    pub async fn load(&self) -> Result<MetadataSnapshot> {
        let version = self.installed_version().await?;
        if version.is_none() {
            return Ok(MetadataSnapshot::default());
        }
        Ok(MetadataSnapshot {
            version,
            clusters: self.select(MetadataTable::Clusters).await?,
            instances: self.select(MetadataTable::Instances).await?,
            clustersets: self.select(MetadataTable::ClusterSets).await?,
            roles: self.select(MetadataTable::ClusterRoles).await?,
        })
    }

    /// Commit buffered writes atomically. An empty transaction is a no-op.
    pub async fn commit(&self, txn: MetadataTxn) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Committing {} metadata write(s) on {}",
            txn.writes.len(),
            self.instance.address()
        );
        self.instance
            .execute(Statement::MetadataCommit { writes: txn.writes })
            .await?;
        Ok(())
    }
}

/// Version gate shared by every operation
pub fn gate_version(version: SchemaVersion, for_write: bool) -> Result<()> {
    if version.is_upgrading() {
        return Err(Error::CrashRecoveryRequired(
            "metadata schema is mid-upgrade; re-run upgradeMetadata".into(),
        ));
    }
    if version > SchemaVersion::CURRENT {
        return Err(Error::InvalidState(format!(
            "metadata version {} is newer than the supported {}",
            version,
            SchemaVersion::CURRENT
        )));
    }
    if for_write && version < SchemaVersion::CURRENT {
        return Err(Error::InvalidState(format!(
            "metadata version {} is outdated (current is {}); run upgradeMetadata first",
            version,
            SchemaVersion::CURRENT
        )));
    }
    Ok(())
}
