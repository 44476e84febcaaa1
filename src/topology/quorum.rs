//! Quorum evaluator
//!
//! Pure function from (registered instances, probe outcomes) to cluster
//! health. The consensus-visible membership is taken from the freshest view
//! (highest view id) reported by a reachable ONLINE member of the cluster's
//! group. Quorum holds iff a strict majority of that view is reachable and
//! agrees on it.
//!
//! The `_PARTIAL` suffix is reported when some consensus-visible member is
//! not ONLINE while quorum holds (an UNREACHABLE member the group has not
//! expelled yet, or a RECOVERING one). Registered members that are absent
//! from the view are listed as `(MISSING)` / `OFFLINE` / `ERROR` but do not
//! change the tolerance label.

use crate::topology::model::{InstanceRecord, InstanceRole, MemberState};
use crate::topology::probe::{ProbeOutcome, ProbeResult};
use crate::topology::session::GroupMemberRow;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Cluster-level availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Ok,
    OkNoTolerance,
    OkPartial,
    OkNoTolerancePartial,
    NoQuorum,
    Unknown,
}

impl ClusterStatus {
    pub fn has_quorum(&self) -> bool {
        !matches!(self, ClusterStatus::NoQuorum | ClusterStatus::Unknown)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Ok => "OK",
            ClusterStatus::OkNoTolerance => "OK_NO_TOLERANCE",
            ClusterStatus::OkPartial => "OK_PARTIAL",
            ClusterStatus::OkNoTolerancePartial => "OK_NO_TOLERANCE_PARTIAL",
            ClusterStatus::NoQuorum => "NO_QUORUM",
            ClusterStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Per-member classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemberClassification {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "RECOVERING")]
    Recovering,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
    #[serde(rename = "(MISSING)")]
    Missing,
}

impl fmt::Display for MemberClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberClassification::Online => "ONLINE",
            MemberClassification::Recovering => "RECOVERING",
            MemberClassification::Offline => "OFFLINE",
            MemberClassification::Error => "ERROR",
            MemberClassification::Unreachable => "UNREACHABLE",
            MemberClassification::Missing => "(MISSING)",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberHealth {
    pub address: String,
    pub instance_id: Option<String>,
    /// Present in metadata
    pub registered: bool,
    /// Present in the consensus-visible view
    pub in_view: bool,
    pub reachable: bool,
    pub state: MemberClassification,
    pub role: Option<InstanceRole>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub status: ClusterStatus,
    pub quorum: bool,
    /// Additional failures the group survives
    pub tolerance: usize,
    pub view_size: usize,
    pub view_id: Option<u64>,
    pub multi_primary: Option<bool>,
    /// Address of the primary (single-primary only)
    pub primary: Option<String>,
    pub members: Vec<MemberHealth>,
}

impl ClusterHealth {
    pub fn member(&self, address: &str) -> Option<&MemberHealth> {
        self.members.iter().find(|m| m.address == address)
    }

    /// In the view but not in metadata
    pub fn unmanaged(&self) -> impl Iterator<Item = &MemberHealth> {
        self.members.iter().filter(|m| !m.registered)
    }

    pub fn online(&self) -> impl Iterator<Item = &MemberHealth> {
        self.members
            .iter()
            .filter(|m| m.state == MemberClassification::Online && m.reachable)
    }

    /// Every registered member is reachable and ONLINE
    pub fn all_registered_online(&self) -> bool {
        self.members
            .iter()
            .filter(|m| m.registered)
            .all(|m| m.reachable && m.state == MemberClassification::Online)
    }

    pub fn status_text(&self) -> String {
        let online = self.online().count();
        match self.status {
            ClusterStatus::Ok | ClusterStatus::OkPartial => format!(
                "Cluster is ONLINE and can tolerate up to {} failure{}.",
                self.tolerance,
                if self.tolerance == 1 { "" } else { "s" }
            ),
            ClusterStatus::OkNoTolerance | ClusterStatus::OkNoTolerancePartial => {
                "Cluster is NOT tolerant to any failures.".to_string()
            }
            ClusterStatus::NoQuorum => format!(
                "Cluster has no quorum as visible from the reachable members ({} of {} online) and cannot process write transactions.",
                online, self.view_size
            ),
            ClusterStatus::Unknown => {
                "Cluster status cannot be determined: no member is reachable.".to_string()
            }
        }
    }
}

pub struct QuorumEvaluator;

impl QuorumEvaluator {
    /// Evaluate the health of the cluster whose consensus group is
    /// `group_name`. `probes` may cover more addresses than `registered`
    /// (view members missing from metadata).
    pub fn evaluate(
        group_name: &str,
        registered: &[InstanceRecord],
        probes: &[ProbeOutcome],
    ) -> ClusterHealth {
        let by_address: HashMap<&str, &ProbeOutcome> =
            probes.iter().map(|p| (p.address(), p)).collect();

        let in_group = |r: &&ProbeResult| r.group_name.as_deref() == Some(group_name);

        let reference = probes
            .iter()
            .filter_map(ProbeOutcome::result)
            .filter(in_group)
            .filter(|r| r.state == MemberState::Online && r.view_id.is_some())
            .fold(None::<&ProbeResult>, |best, r| match best {
                Some(b) if b.view_id >= r.view_id => Some(b),
                _ => Some(r),
            });

        let Some(reference) = reference else {
            return Self::without_view(registered, &by_address);
        };

        let view: &[GroupMemberRow] = &reference.members;
        let mut members = Vec::new();
        let mut active_agreeing = 0usize;
        let mut fully_online = 0usize;

        for row in view {
            let own = by_address.get(row.address.as_str()).copied();
            let (reachable, agrees) = match own {
                Some(ProbeOutcome::Reachable(r)) => {
                    let same_view = r.view_id == reference.view_id
                        || r.state == MemberState::Recovering;
                    (true, in_group(&r) && r.state.is_active() && same_view)
                }
                Some(ProbeOutcome::Unreachable { .. }) => (false, false),
                // Not probed: trust the reference view
                None => (row.state.is_active(), row.state.is_active()),
            };

            let state = if !reachable {
                MemberClassification::Unreachable
            } else {
                match row.state {
                    MemberState::Online if agrees => MemberClassification::Online,
                    MemberState::Recovering if agrees => MemberClassification::Recovering,
                    MemberState::Online | MemberState::Recovering => MemberClassification::Error,
                    MemberState::Offline => MemberClassification::Offline,
                    MemberState::Error => MemberClassification::Error,
                    MemberState::Unreachable => MemberClassification::Unreachable,
                }
            };

            if agrees && row.state.is_active() {
                active_agreeing += 1;
            }
            if state == MemberClassification::Online {
                fully_online += 1;
            }

            let record = registered.iter().find(|r| r.address == row.address);
            members.push(MemberHealth {
                address: row.address.clone(),
                instance_id: Some(row.member_id.clone()),
                registered: record.is_some(),
                in_view: true,
                reachable,
                state,
                role: row.role,
            });
        }

        for record in registered {
            if members.iter().any(|m| m.address == record.address) {
                continue;
            }
            members.push(Self::outside_view(record, &by_address));
        }

        // Registered members first, in metadata order
        members.sort_by_key(|m| {
            registered
                .iter()
                .position(|r| r.address == m.address)
                .unwrap_or(usize::MAX)
        });

        let view_size = view.len();
        let quorum = active_agreeing * 2 > view_size;
        let tolerance = if quorum {
            active_agreeing.saturating_sub(view_size / 2 + 1)
        } else {
            0
        };
        let partial = fully_online < view_size;

        let status = match (quorum, tolerance > 0, partial) {
            (false, _, _) => ClusterStatus::NoQuorum,
            (true, true, false) => ClusterStatus::Ok,
            (true, true, true) => ClusterStatus::OkPartial,
            (true, false, false) => ClusterStatus::OkNoTolerance,
            (true, false, true) => ClusterStatus::OkNoTolerancePartial,
        };

        let primary = reference.view_primary().map(|p| p.address.clone());

        ClusterHealth {
            status,
            quorum,
            tolerance,
            view_size,
            view_id: reference.view_id,
            multi_primary: Some(reference.multi_primary),
            primary,
            members,
        }
    }

    fn without_view(
        registered: &[InstanceRecord],
        by_address: &HashMap<&str, &ProbeOutcome>,
    ) -> ClusterHealth {
        let members: Vec<MemberHealth> = registered
            .iter()
            .map(|r| Self::outside_view(r, by_address))
            .collect();
        let any_reachable = members.iter().any(|m| m.reachable);

        ClusterHealth {
            status: if any_reachable {
                ClusterStatus::NoQuorum
            } else {
                ClusterStatus::Unknown
            },
            quorum: false,
            tolerance: 0,
            view_size: 0,
            view_id: None,
            multi_primary: None,
            primary: None,
            members,
        }
    }

    fn outside_view(
        record: &InstanceRecord,
        by_address: &HashMap<&str, &ProbeOutcome>,
    ) -> MemberHealth {
        let (reachable, state) = match by_address.get(record.address.as_str()) {
            Some(ProbeOutcome::Reachable(r)) => (
                true,
                match r.state {
                    MemberState::Offline => MemberClassification::Offline,
                    MemberState::Error => MemberClassification::Error,
                    _ => MemberClassification::Missing,
                },
            ),
            _ => (false, MemberClassification::Missing),
        };
        MemberHealth {
            address: record.address.clone(),
            instance_id: Some(record.instance_id.clone()),
            registered: true,
            in_view: false,
            reachable,
            state,
            role: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::gtid::GtidSet;

    const GROUP: &str = "grp-1";

    fn record(addr: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: format!("uuid-{}", addr),
            cluster_id: "c1".into(),
            address: addr.into(),
            server_id: 1,
            options: Default::default(),
        }
    }

    fn row(addr: &str, state: MemberState, role: Option<InstanceRole>) -> GroupMemberRow {
        GroupMemberRow {
            member_id: format!("uuid-{}", addr),
            address: addr.into(),
            state,
            role,
        }
    }

    fn online(addr: &str, view_id: u64, view: Vec<GroupMemberRow>) -> ProbeOutcome {
        let role = view.iter().find(|r| r.address == addr).and_then(|r| r.role);
        ProbeOutcome::Reachable(ProbeResult {
            address: addr.into(),
            server_uuid: format!("uuid-{}", addr),
            server_id: 1,
            state: MemberState::Online,
            role,
            group_name: Some(GROUP.into()),
            view_id: Some(view_id),
            multi_primary: false,
            gtid_executed: GtidSet::new(),
            super_read_only: false,
            auto_increment: (1, 2),
            members: view,
            channels: vec![],
        })
    }

    fn offline(addr: &str) -> ProbeOutcome {
        ProbeOutcome::Reachable(ProbeResult {
            address: addr.into(),
            server_uuid: format!("uuid-{}", addr),
            server_id: 1,
            state: MemberState::Offline,
            role: None,
            group_name: None,
            view_id: None,
            multi_primary: false,
            gtid_executed: GtidSet::new(),
            super_read_only: true,
            auto_increment: (1, 2),
            members: vec![],
            channels: vec![],
        })
    }

    fn down(addr: &str) -> ProbeOutcome {
        ProbeOutcome::Unreachable {
            address: addr.into(),
            reason: "connection refused".into(),
        }
    }

    fn full_view() -> Vec<GroupMemberRow> {
        vec![
            row("a:1", MemberState::Online, Some(InstanceRole::Primary)),
            row("b:1", MemberState::Online, Some(InstanceRole::Secondary)),
            row("c:1", MemberState::Online, Some(InstanceRole::Secondary)),
        ]
    }

    #[test]
    fn test_three_online_is_ok() {
        let registered = vec![record("a:1"), record("b:1"), record("c:1")];
        let probes = vec![
            online("a:1", 3, full_view()),
            online("b:1", 3, full_view()),
            online("c:1", 3, full_view()),
        ];
        let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
        assert_eq!(health.status, ClusterStatus::Ok);
        assert_eq!(health.tolerance, 1);
        assert_eq!(health.primary.as_deref(), Some("a:1"));
        assert!(health.all_registered_online());
    }

    #[test]
    fn test_unreachable_in_view_is_partial() {
        let registered = vec![record("a:1"), record("b:1"), record("c:1")];
        let mut view = full_view();
        view[2].state = MemberState::Unreachable;
        let probes = vec![
            online("a:1", 3, view.clone()),
            online("b:1", 3, view),
            down("c:1"),
        ];
        let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
        assert_eq!(health.status, ClusterStatus::OkNoTolerancePartial);
        assert!(health.quorum);
        assert_eq!(
            health.member("c:1").unwrap().state,
            MemberClassification::Unreachable
        );
    }

    #[test]
    fn test_minority_has_no_quorum() {
        let registered = vec![record("a:1"), record("b:1"), record("c:1")];
        let mut view = full_view();
        view[1].state = MemberState::Unreachable;
        view[2].state = MemberState::Unreachable;
        let probes = vec![online("a:1", 4, view), down("b:1"), down("c:1")];
        let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
        assert_eq!(health.status, ClusterStatus::NoQuorum);
        assert!(!health.quorum);
    }

    #[test]
    fn test_view_members_that_disagree_do_not_count() {
        // b and c still appear ONLINE in a's stale view but are reachable
        // and report a different view: they do not back a's quorum.
        let registered = vec![record("a:1"), record("b:1"), record("c:1")];
        let stale = full_view();
        let other = vec![
            row("b:1", MemberState::Online, Some(InstanceRole::Primary)),
            row("c:1", MemberState::Online, Some(InstanceRole::Secondary)),
        ];
        let probes = vec![
            online("a:1", 9, stale),
            online("b:1", 4, other.clone()),
            online("c:1", 4, other),
        ];
        let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
        assert!(!health.quorum);
    }

    #[test]
    fn test_forced_single_member_reports_missing() {
        let registered = vec![record("a:1"), record("b:1"), record("c:1")];
        let view = vec![row("a:1", MemberState::Online, Some(InstanceRole::Primary))];
        let probes = vec![online("a:1", 7, view), down("b:1"), down("c:1")];
        let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
        assert_eq!(health.status, ClusterStatus::OkNoTolerance);
        assert_eq!(
            health.member("b:1").unwrap().state,
            MemberClassification::Missing
        );
        assert_eq!(health.members[2].state.to_string(), "(MISSING)");
    }

    #[test]
    fn test_all_offline_is_no_quorum_and_all_down_is_unknown() {
        let registered = vec![record("a:1"), record("b:1")];
        let health =
            QuorumEvaluator::evaluate(GROUP, &registered, &[offline("a:1"), offline("b:1")]);
        assert_eq!(health.status, ClusterStatus::NoQuorum);
        assert_eq!(health.members[0].state, MemberClassification::Offline);

        let health = QuorumEvaluator::evaluate(GROUP, &registered, &[down("a:1"), down("b:1")]);
        assert_eq!(health.status, ClusterStatus::Unknown);
    }

    #[test]
    fn test_unmanaged_member() {
        let registered = vec![record("a:1")];
        let view = vec![
            row("a:1", MemberState::Online, Some(InstanceRole::Primary)),
            row("x:1", MemberState::Online, Some(InstanceRole::Secondary)),
        ];
        let probes = vec![online("a:1", 2, view)];
        let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
        assert!(health.quorum);
        let unmanaged: Vec<_> = health.unmanaged().map(|m| m.address.clone()).collect();
        assert_eq!(unmanaged, vec!["x:1".to_string()]);
    }

    /// Quorum is never reported when fewer than a strict majority of the
    /// view is reachable, for every split of a view up to 7 members.
    #[test]
    fn test_never_ok_without_majority() {
        for size in 1..=7usize {
            for reachable in 0..=size {
                let addrs: Vec<String> = (0..size).map(|i| format!("m{}:1", i)).collect();
                let registered: Vec<_> = addrs.iter().map(|a| record(a)).collect();
                let view: Vec<_> = addrs
                    .iter()
                    .enumerate()
                    .map(|(i, a)| {
                        let state = if i < reachable {
                            MemberState::Online
                        } else {
                            MemberState::Unreachable
                        };
                        let role = if i == 0 {
                            InstanceRole::Primary
                        } else {
                            InstanceRole::Secondary
                        };
                        row(a, state, Some(role))
                    })
                    .collect();
                let probes: Vec<_> = addrs
                    .iter()
                    .enumerate()
                    .map(|(i, a)| {
                        if i < reachable {
                            online(a, 1, view.clone())
                        } else {
                            down(a)
                        }
                    })
                    .collect();
                let health = QuorumEvaluator::evaluate(GROUP, &registered, &probes);
                let majority = reachable * 2 > size;
                assert_eq!(health.quorum, majority, "size={} reachable={}", size, reachable);
                if !majority {
                    assert!(!health.status.has_quorum());
                }
            }
        }
    }
}
