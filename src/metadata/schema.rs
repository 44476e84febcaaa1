//! Logical layout of the metadata schema
//!
//! Four tables (`clusters`, `instances`, `clustersets`, `cluster_roles`)
//! live in the replicated schema. The upgrade marker and the backup schema
//! are kept beside it so they survive the live schema being mid-upgrade.

use crate::common::SchemaVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const METADATA_SCHEMA: &str = "clusterkit_metadata";
pub const BACKUP_SCHEMA: &str = "clusterkit_metadata_backup";
pub const MARKER_TABLE: &str = "clusterkit_upgrade_marker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataTable {
    Clusters,
    Instances,
    ClusterSets,
    ClusterRoles,
}

impl MetadataTable {
    pub const ALL: [MetadataTable; 4] = [
        MetadataTable::Clusters,
        MetadataTable::Instances,
        MetadataTable::ClusterSets,
        MetadataTable::ClusterRoles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetadataTable::Clusters => "clusters",
            MetadataTable::Instances => "instances",
            MetadataTable::ClusterSets => "clustersets",
            MetadataTable::ClusterRoles => "cluster_roles",
        }
    }
}

impl fmt::Display for MetadataTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", METADATA_SCHEMA, self.name())
    }
}

/// One row change inside a metadata transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataWrite {
    Upsert {
        table: MetadataTable,
        key: String,
        record: serde_json::Value,
    },
    Delete {
        table: MetadataTable,
        key: String,
    },
}

/// Durable upgrade progress. Absence of the marker row means `NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeState {
    SettingUpgradeVersion,
    Upgrading,
    Done,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpgradeState::SettingUpgradeVersion => "SETTING_UPGRADE_VERSION",
            UpgradeState::Upgrading => "UPGRADING",
            UpgradeState::Done => "DONE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for UpgradeState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SETTING_UPGRADE_VERSION" => Ok(UpgradeState::SettingUpgradeVersion),
            "UPGRADING" => Ok(UpgradeState::Upgrading),
            "DONE" => Ok(UpgradeState::Done),
            other => Err(crate::Error::Argument(format!(
                "invalid upgrade marker '{}'",
                other
            ))),
        }
    }
}

/// Which copy of the metadata a schema row describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    Live,
    Backup,
}

/// Row returned by `Statement::QueryMetadataSchemas`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRow {
    pub schema: SchemaKind,
    pub version: SchemaVersion,
}

/// Row returned by `Statement::MetadataSelect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub key: String,
    pub record: serde_json::Value,
}

/// Row returned by `Statement::QueryUpgradeMarker`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerRow {
    pub state: UpgradeState,
}
