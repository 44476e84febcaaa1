//! Audit trail for topology mutations
//!
//! Every operation that changes membership, roles, replication channels or
//! metadata leaves one structured entry. Entries go to an optional
//! append-only JSON-lines file and to `tracing` under the `audit` target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    ClusterCreated,
    ClusterDissolved,
    ClusterRebooted,
    ClusterRescanned,
    InstanceAdded,
    InstanceRemoved,
    InstanceRejoined,
    PrimaryChanged,
    TopologyModeChanged,
    QuorumForced,
    ClusterSetCreated,
    ReplicaClusterCreated,
    ReplicaClusterRemoved,
    Switchover,
    Failover,
    ClusterInvalidated,
    ClusterRejoined,
    MetadataUpgraded,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub actor: String,
    pub target: Option<String>,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Audit logger
pub struct AuditLogger {
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    /// Logger that only emits `tracing` events
    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Logger appending to `path`; falls back to tracing-only when the file
    /// cannot be opened.
    pub fn new(path: &Path) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(Mutex::new(f)),
            Err(e) => {
                tracing::warn!("Cannot open audit log {}: {}", path.display(), e);
                None
            }
        };
        Self { file }
    }

    /// Log an audit entry
    pub fn log(&self, entry: AuditEntry) {
        let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", line);
            }
        }
        tracing::info!(target: "audit", event = ?entry.event, target_name = ?entry.target, "{}", entry.message);
    }

    /// Convenience for logging an event
    pub fn log_event(
        &self,
        event: AuditEventType,
        actor: impl Into<String>,
        target: Option<String>,
        message: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target,
            message: message.into(),
            meta,
        };
        self.log(entry);
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::disabled()
    }
}
