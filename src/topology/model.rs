//! Topology data model
//!
//! Persisted records (`*Record`) hold identity and options only. Live state
//! such as [`MemberState`] is never stored; it is re-derived from probes on
//! every operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Name of the asynchronous channel linking a replica cluster to the
/// global primary.
pub const CLUSTERSET_CHANNEL: &str = "clusterset_replication";

/// Role of a member inside its consensus group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRole {
    Primary,
    Secondary,
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Primary => write!(f, "PRIMARY"),
            InstanceRole::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// Member state as reported by the consensus engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
}

impl MemberState {
    /// Counts towards the group majority
    pub fn is_active(&self) -> bool {
        matches!(self, MemberState::Online | MemberState::Recovering)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Online => "ONLINE",
            MemberState::Recovering => "RECOVERING",
            MemberState::Offline => "OFFLINE",
            MemberState::Error => "ERROR",
            MemberState::Unreachable => "UNREACHABLE",
        };
        write!(f, "{}", s)
    }
}

/// Cluster-wide write topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopologyMode {
    SinglePrimary,
    MultiPrimary,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::SinglePrimary => write!(f, "Single-Primary"),
            TopologyMode::MultiPrimary => write!(f, "Multi-Primary"),
        }
    }
}

/// Role of a cluster inside its ClusterSet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    Primary,
    Replica,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Primary => write!(f, "PRIMARY"),
            ClusterRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// What a member does when it drops out of the group involuntarily
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStateAction {
    ReadOnly,
    OfflineMode,
    AbortServer,
}

impl FromStr for ExitStateAction {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READ_ONLY" => Ok(ExitStateAction::ReadOnly),
            "OFFLINE_MODE" => Ok(ExitStateAction::OfflineMode),
            "ABORT_SERVER" => Ok(ExitStateAction::AbortServer),
            other => Err(crate::Error::Argument(format!(
                "invalid exitStateAction '{}': expected READ_ONLY, OFFLINE_MODE or ABORT_SERVER",
                other
            ))),
        }
    }
}

/// Per-instance options kept in metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_weight: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_state_action: Option<ExitStateAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// `clusters` table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: String,
    pub name: String,
    pub topology_mode: TopologyMode,
    /// Consensus group identifier shared by every member
    pub group_name: String,
    /// Last confirmed primary (single-primary only). Re-read, never cached.
    #[serde(default)]
    pub primary_instance: Option<String>,
    #[serde(default)]
    pub clusterset_id: Option<String>,
    /// Routing options and other free-form attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
}

/// `instances` table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub cluster_id: String,
    pub address: String,
    pub server_id: u32,
    #[serde(default)]
    pub options: InstanceOptions,
}

/// `clustersets` table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSetRecord {
    pub clusterset_id: String,
    pub domain: String,
    pub primary_cluster: String,
    /// Bumped on every switchover and failover; the highest generation seen
    /// among reachable copies is the freshest view of the ClusterSet.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// `cluster_roles` table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRoleRecord {
    pub clusterset_id: String,
    pub cluster_id: String,
    pub role: ClusterRole,
    #[serde(default)]
    pub invalidated: bool,
}

impl ClusterRoleRecord {
    /// `PRIMARY`, `REPLICA` or `REPLICA-INVALIDATED`
    pub fn display_role(&self) -> String {
        if self.invalidated {
            format!("{}-INVALIDATED", self.role)
        } else {
            self.role.to_string()
        }
    }
}

/// `auto_increment_increment` / `auto_increment_offset` for a member of a
/// multi-primary group of `members` instances.
pub fn multi_primary_auto_increment(server_id: u32, members: usize) -> (u32, u32) {
    let n = members.max(7) as u32;
    (n, 1 + server_id % n)
}

/// Values restored when a group goes back to single-primary
pub const SINGLE_PRIMARY_AUTO_INCREMENT: (u32, u32) = (1, 2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_increment_small_cluster() {
        assert_eq!(multi_primary_auto_increment(1, 3), (7, 2));
        assert_eq!(multi_primary_auto_increment(7, 3), (7, 1));
        assert_eq!(multi_primary_auto_increment(100, 1), (7, 3));
    }

    #[test]
    fn test_auto_increment_large_cluster() {
        assert_eq!(multi_primary_auto_increment(9, 9), (9, 1));
        assert_eq!(multi_primary_auto_increment(10, 9), (9, 2));
    }

    #[test]
    fn test_display_role() {
        let mut role = ClusterRoleRecord {
            clusterset_id: "cs".into(),
            cluster_id: "c".into(),
            role: ClusterRole::Replica,
            invalidated: false,
        };
        assert_eq!(role.display_role(), "REPLICA");
        role.invalidated = true;
        assert_eq!(role.display_role(), "REPLICA-INVALIDATED");
    }

    #[test]
    fn test_exit_state_action_parse() {
        assert_eq!(
            "read_only".parse::<ExitStateAction>().unwrap(),
            ExitStateAction::ReadOnly
        );
        assert!("explode".parse::<ExitStateAction>().is_err());
    }

    #[test]
    fn test_member_state_serde() {
        let json = serde_json::to_string(&MemberState::Recovering).unwrap();
        assert_eq!(json, "\"RECOVERING\"");
        assert!(MemberState::Recovering.is_active());
        assert!(!MemberState::Unreachable.is_active());
    }
}
