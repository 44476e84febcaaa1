//! Member probe
//!
//! Reads one instance's own view of group membership, role and replication
//! channels. A probe never fails: connection errors, query errors and
//! timeouts all resolve to [`ProbeOutcome::Unreachable`].

use crate::topology::gtid::GtidSet;
use crate::topology::instance::Instance;
use crate::topology::model::{InstanceRole, MemberState};
use crate::topology::session::{ChannelRow, GroupMemberRow, MemberInfoRow, SessionProvider};
use futures_util::future::join_all;
use serde::Serialize;
use std::time::Duration;

/// What a reachable instance reported about itself
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub address: String,
    pub server_uuid: String,
    pub server_id: u32,
    pub state: MemberState,
    /// Own role, when the instance is an active group member
    pub role: Option<InstanceRole>,
    pub group_name: Option<String>,
    pub view_id: Option<u64>,
    pub multi_primary: bool,
    pub gtid_executed: GtidSet,
    pub super_read_only: bool,
    pub auto_increment: (u32, u32),
    /// Group membership as seen from this instance
    pub members: Vec<GroupMemberRow>,
    pub channels: Vec<ChannelRow>,
}

impl ProbeResult {
    fn from_rows(
        info: MemberInfoRow,
        members: Vec<GroupMemberRow>,
        channels: Vec<ChannelRow>,
    ) -> Self {
        let role = members
            .iter()
            .find(|m| m.member_id == info.server_uuid)
            .and_then(|m| m.role);
        Self {
            address: info.address,
            server_uuid: info.server_uuid,
            server_id: info.server_id,
            state: info.member_state,
            role,
            group_name: info.group_name,
            view_id: info.view_id,
            multi_primary: info.multi_primary,
            gtid_executed: info.gtid_executed,
            super_read_only: info.super_read_only,
            auto_increment: (info.auto_increment_increment, info.auto_increment_offset),
            members,
            channels,
        }
    }

    /// Primary according to this member's view (single-primary only)
    pub fn view_primary(&self) -> Option<&GroupMemberRow> {
        if self.multi_primary {
            return None;
        }
        self.members
            .iter()
            .find(|m| m.role == Some(InstanceRole::Primary) && m.state == MemberState::Online)
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelRow> {
        self.channels.iter().find(|c| c.channel == name)
    }
}

/// Outcome of probing one address
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Reachable(ProbeResult),
    Unreachable { address: String, reason: String },
}

impl ProbeOutcome {
    pub fn address(&self) -> &str {
        match self {
            ProbeOutcome::Reachable(r) => &r.address,
            ProbeOutcome::Unreachable { address, .. } => address,
        }
    }

    pub fn result(&self) -> Option<&ProbeResult> {
        match self {
            ProbeOutcome::Reachable(r) => Some(r),
            ProbeOutcome::Unreachable { .. } => None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }
}

/// Bounded, side-effect free status reader
#[derive(Debug, Clone, Copy)]
pub struct MemberProbe {
    timeout: Duration,
}

impl MemberProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn probe(&self, provider: &dyn SessionProvider, address: &str) -> ProbeOutcome {
        let attempt = async {
            let instance = Instance::connect(provider, address, self.timeout).await?;
            let result = async {
                let info = instance.member_info().await?;
                let members = instance.group_members().await?;
                let channels = instance.channels().await?;
                crate::Result::Ok(ProbeResult::from_rows(info, members, channels))
            }
            .await;
            instance.close().await;
            result
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(mut result)) => {
                // Report under the address we were asked about, which is the
                // key metadata uses.
                result.address = address.to_string();
                ProbeOutcome::Reachable(result)
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe of {} failed: {}", address, e);
                ProbeOutcome::Unreachable {
                    address: address.to_string(),
                    reason: e.to_string(),
                }
            }
            Err(_) => ProbeOutcome::Unreachable {
                address: address.to_string(),
                reason: format!("probe timed out after {:?}", self.timeout),
            },
        }
    }

    /// Probe every address concurrently; output order matches input order
    pub async fn probe_all(
        &self,
        provider: &dyn SessionProvider,
        addresses: &[String],
    ) -> Vec<ProbeOutcome> {
        join_all(addresses.iter().map(|a| self.probe(provider, a))).await
    }
}
