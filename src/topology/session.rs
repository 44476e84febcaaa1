//! Session seam towards database instances
//!
//! The orchestrator never builds SQL strings by hand. Every query and
//! administrative command is a [`Statement`] variant; a driver adapter
//! renders it with `Display` and forwards the text, while the in-memory
//! fleet in [`crate::testing`] interprets the variant directly. Result sets
//! come back as JSON object rows and are decoded into the typed row structs
//! below.

use crate::common::{Result, SchemaVersion};
use crate::metadata::schema::{
    MetadataTable, MetadataWrite, UpgradeState, BACKUP_SCHEMA, MARKER_TABLE, METADATA_SCHEMA,
};
use crate::topology::gtid::GtidSet;
use crate::topology::model::{ExitStateAction, InstanceRole, MemberState};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One result row
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Server variables the orchestrator manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemVariable {
    AutoIncrementIncrement,
    AutoIncrementOffset,
    SuperReadOnly,
}

impl SystemVariable {
    pub fn name(&self) -> &'static str {
        match self {
            SystemVariable::AutoIncrementIncrement => "auto_increment_increment",
            SystemVariable::AutoIncrementOffset => "auto_increment_offset",
            SystemVariable::SuperReadOnly => "super_read_only",
        }
    }
}

/// Every statement the orchestrator can send to an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    // === Status reads ===
    QueryMemberInfo,
    QueryGroupMembers,
    QueryReplicationChannels,

    // === Group replication ===
    StartGroupReplication {
        group_name: String,
        bootstrap: bool,
        multi_primary: bool,
        seeds: Vec<String>,
        member_weight: Option<u8>,
        exit_state_action: Option<ExitStateAction>,
    },
    StopGroupReplication,
    SetAsPrimary {
        member_id: String,
        running_transactions_timeout: Option<u32>,
    },
    SwitchToMultiPrimary,
    SwitchToSinglePrimary {
        member_id: Option<String>,
    },
    ForceMembers {
        addresses: Vec<String>,
    },
    SetGlobal {
        variable: SystemVariable,
        value: u32,
    },
    Clone {
        donor: String,
    },

    // === Asynchronous channels ===
    ChangeReplicationSource {
        channel: String,
        source: String,
    },
    StartReplica {
        channel: String,
    },
    StopReplica {
        channel: String,
    },
    ResetReplica {
        channel: String,
    },

    // === Metadata schema ===
    CreateMetadataSchema {
        version: SchemaVersion,
    },
    DropMetadataSchema,
    QueryMetadataSchemas,
    SetMetadataVersion {
        version: SchemaVersion,
    },
    MetadataSelect {
        table: MetadataTable,
    },
    MetadataCommit {
        writes: Vec<MetadataWrite>,
    },
    QueryUpgradeMarker,
    SetUpgradeMarker {
        state: Option<UpgradeState>,
    },
    BackupMetadataSchema,
    RestoreMetadataSchema,
    DropMetadataBackup,
    MigrateMetadataSchema {
        from: SchemaVersion,
        to: SchemaVersion,
    },

    // === Advisory locks ===
    AcquireLock {
        name: String,
        exclusive: bool,
    },
    ReleaseLock {
        name: String,
    },
}

impl Statement {
    /// Statements that change server state, as opposed to pure reads
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Statement::QueryMemberInfo
                | Statement::QueryGroupMembers
                | Statement::QueryReplicationChannels
                | Statement::QueryMetadataSchemas
                | Statement::MetadataSelect { .. }
                | Statement::QueryUpgradeMarker
        )
    }
}

fn quoted_list(items: &[String]) -> String {
    items.join(",")
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::QueryMemberInfo => write!(
                f,
                "SELECT @@server_uuid, @@server_id, @@report_host, @@super_read_only, \
                 @@auto_increment_increment, @@auto_increment_offset, @@gtid_executed, \
                 @@group_replication_group_name, @@group_replication_single_primary_mode"
            ),
            Statement::QueryGroupMembers => write!(
                f,
                "SELECT member_id, CONCAT(member_host, ':', member_port) AS address, \
                 member_state, member_role FROM performance_schema.replication_group_members"
            ),
            Statement::QueryReplicationChannels => write!(
                f,
                "SELECT channel_name, source, io_running, sql_running, last_error \
                 FROM performance_schema.replication_connection_status"
            ),
            Statement::StartGroupReplication {
                group_name,
                bootstrap,
                multi_primary,
                seeds,
                ..
            } => write!(
                f,
                "SET GLOBAL group_replication_group_name = '{}', \
                 group_replication_single_primary_mode = {}, \
                 group_replication_group_seeds = '{}', \
                 group_replication_bootstrap_group = {}; START GROUP_REPLICATION",
                group_name,
                if *multi_primary { "OFF" } else { "ON" },
                quoted_list(seeds),
                if *bootstrap { "ON" } else { "OFF" }
            ),
            Statement::StopGroupReplication => write!(f, "STOP GROUP_REPLICATION"),
            Statement::SetAsPrimary {
                member_id,
                running_transactions_timeout,
            } => match running_transactions_timeout {
                Some(t) => write!(
                    f,
                    "SELECT group_replication_set_as_primary('{}', {})",
                    member_id, t
                ),
                None => write!(f, "SELECT group_replication_set_as_primary('{}')", member_id),
            },
            Statement::SwitchToMultiPrimary => {
                write!(f, "SELECT group_replication_switch_to_multi_primary_mode()")
            }
            Statement::SwitchToSinglePrimary { member_id } => match member_id {
                Some(id) => write!(
                    f,
                    "SELECT group_replication_switch_to_single_primary_mode('{}')",
                    id
                ),
                None => write!(f, "SELECT group_replication_switch_to_single_primary_mode()"),
            },
            Statement::ForceMembers { addresses } => write!(
                f,
                "SET GLOBAL group_replication_force_members = '{}'",
                quoted_list(addresses)
            ),
            Statement::SetGlobal { variable, value } => {
                write!(f, "SET PERSIST {} = {}", variable.name(), value)
            }
            Statement::Clone { donor } => write!(f, "CLONE INSTANCE FROM '{}'", donor),
            Statement::ChangeReplicationSource { channel, source } => write!(
                f,
                "CHANGE REPLICATION SOURCE TO SOURCE_HOST_PORT = '{}', SOURCE_AUTO_POSITION = 1 \
                 FOR CHANNEL '{}'",
                source, channel
            ),
            Statement::StartReplica { channel } => {
                write!(f, "START REPLICA FOR CHANNEL '{}'", channel)
            }
            Statement::StopReplica { channel } => {
                write!(f, "STOP REPLICA FOR CHANNEL '{}'", channel)
            }
            Statement::ResetReplica { channel } => {
                write!(f, "RESET REPLICA ALL FOR CHANNEL '{}'", channel)
            }
            Statement::CreateMetadataSchema { version } => write!(
                f,
                "CREATE SCHEMA {} /* version {} */",
                METADATA_SCHEMA, version
            ),
            Statement::DropMetadataSchema => write!(f, "DROP SCHEMA IF EXISTS {}", METADATA_SCHEMA),
            Statement::QueryMetadataSchemas => write!(
                f,
                "SELECT schema_name, version FROM information_schema.schemata \
                 WHERE schema_name IN ('{}', '{}')",
                METADATA_SCHEMA, BACKUP_SCHEMA
            ),
            Statement::SetMetadataVersion { version } => write!(
                f,
                "UPDATE {}.schema_version SET version = '{}'",
                METADATA_SCHEMA, version
            ),
            Statement::MetadataSelect { table } => write!(f, "SELECT * FROM {}", table),
            Statement::MetadataCommit { writes } => {
                write!(f, "START TRANSACTION;")?;
                for w in writes {
                    match w {
                        MetadataWrite::Upsert { table, key, .. } => {
                            write!(f, " REPLACE INTO {} (id, ...) VALUES ('{}', ...);", table, key)?
                        }
                        MetadataWrite::Delete { table, key } => {
                            write!(f, " DELETE FROM {} WHERE id = '{}';", table, key)?
                        }
                    }
                }
                write!(f, " COMMIT")
            }
            Statement::QueryUpgradeMarker => write!(f, "SELECT state FROM mysql.{}", MARKER_TABLE),
            Statement::SetUpgradeMarker { state } => match state {
                Some(s) => write!(f, "REPLACE INTO mysql.{} (state) VALUES ('{}')", MARKER_TABLE, s),
                None => write!(f, "DELETE FROM mysql.{}", MARKER_TABLE),
            },
            Statement::BackupMetadataSchema => write!(
                f,
                "DROP SCHEMA IF EXISTS {b}; CREATE SCHEMA {b}; /* copy tables from {m} */",
                b = BACKUP_SCHEMA,
                m = METADATA_SCHEMA
            ),
            Statement::RestoreMetadataSchema => write!(
                f,
                "DROP SCHEMA IF EXISTS {m}; CREATE SCHEMA {m}; /* copy tables from {b} */",
                b = BACKUP_SCHEMA,
                m = METADATA_SCHEMA
            ),
            Statement::DropMetadataBackup => write!(f, "DROP SCHEMA IF EXISTS {}", BACKUP_SCHEMA),
            Statement::MigrateMetadataSchema { from, to } => write!(
                f,
                "/* metadata DDL {} -> {} */ ALTER TABLE {}.instances ...",
                from, to, METADATA_SCHEMA
            ),
            Statement::AcquireLock { name, exclusive } => write!(
                f,
                "SELECT service_get_{}_locks('clusterkit', '{}', 0)",
                if *exclusive { "write" } else { "read" },
                name
            ),
            Statement::ReleaseLock { name } => {
                write!(f, "SELECT service_release_locks('clusterkit', '{}')", name)
            }
        }
    }
}

/// A connection to one instance
#[async_trait]
pub trait Session: Send + Sync {
    /// Address this session is connected to (`host:port`)
    fn address(&self) -> &str;

    /// Execute one statement and return its result rows
    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>>;

    /// Close the session, releasing any advisory locks it holds
    async fn close(&self);
}

/// Opens sessions; connection failures surface as `Error::Unreachable`
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Session>>;
}

/// Row of `Statement::QueryMemberInfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfoRow {
    pub server_uuid: String,
    pub server_id: u32,
    pub address: String,
    pub member_state: MemberState,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub view_id: Option<u64>,
    #[serde(default)]
    pub multi_primary: bool,
    pub gtid_executed: GtidSet,
    pub super_read_only: bool,
    pub auto_increment_increment: u32,
    pub auto_increment_offset: u32,
}

/// Row of `Statement::QueryGroupMembers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMemberRow {
    pub member_id: String,
    pub address: String,
    pub state: MemberState,
    #[serde(default)]
    pub role: Option<InstanceRole>,
}

/// Row of `Statement::QueryReplicationChannels`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub channel: String,
    #[serde(default)]
    pub source: Option<String>,
    pub io_running: bool,
    pub sql_running: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ChannelRow {
    pub fn is_running(&self) -> bool {
        self.io_running && self.sql_running
    }
}

/// Row of `Statement::AcquireLock`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockRow {
    pub acquired: bool,
}

/// Decode result rows into typed structs
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(serde_json::Value::Object(row)).map_err(Into::into))
        .collect()
}

/// Encode a typed struct as a result row
pub fn encode_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(crate::Error::Internal(format!(
            "row must be a JSON object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sql() {
        let stmt = Statement::SetAsPrimary {
            member_id: "uuid-2".into(),
            running_transactions_timeout: Some(5),
        };
        assert_eq!(
            stmt.to_string(),
            "SELECT group_replication_set_as_primary('uuid-2', 5)"
        );
        let stmt = Statement::SetGlobal {
            variable: SystemVariable::AutoIncrementIncrement,
            value: 7,
        };
        assert_eq!(stmt.to_string(), "SET PERSIST auto_increment_increment = 7");
    }

    #[test]
    fn test_is_mutation() {
        assert!(!Statement::QueryGroupMembers.is_mutation());
        assert!(Statement::StopGroupReplication.is_mutation());
        assert!(Statement::AcquireLock {
            name: "x".into(),
            exclusive: true
        }
        .is_mutation());
    }

    #[test]
    fn test_row_codec() {
        let row = ChannelRow {
            channel: "clusterset_replication".into(),
            source: Some("db1:3306".into()),
            io_running: true,
            sql_running: true,
            last_error: None,
        };
        let encoded = encode_row(&row).unwrap();
        assert_eq!(encoded["source"], "db1:3306");
        let decoded: Vec<ChannelRow> = decode_rows(vec![encoded]).unwrap();
        assert_eq!(decoded[0], row);
        assert!(decoded[0].is_running());
    }
}
