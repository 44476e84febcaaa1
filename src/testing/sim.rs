//! In-memory fleet of simulated instances
//!
//! [`Fleet`] implements [`SessionProvider`] and interprets every
//! [`Statement`] against shared state, with just enough group replication
//! semantics to exercise the orchestrator:
//!
//! - a group keeps a view of member addresses; a member is active while it
//!   is alive and running group replication, and the group has quorum while
//!   a strict majority of its view is active
//! - killing members expels them when the survivors still hold a majority;
//!   otherwise they stay in the view as UNREACHABLE
//! - writes need `super_read_only` off, and inside a group also quorum and
//!   the primary role; the whole data set (GTIDs, metadata, backup, marker)
//!   is copied to every active member
//! - asynchronous channels pull from their source on every statement while
//!   the source is alive and the replica holds no errant transactions

use crate::common::{Error, Result, SchemaVersion};
use crate::metadata::schema::{
    MarkerRow, MetadataTable, MetadataWrite, RecordRow, SchemaKind, SchemaRow, UpgradeState,
};
use crate::topology::gtid::GtidSet;
use crate::topology::model::{InstanceRole, MemberState};
use crate::topology::session::{
    encode_row, ChannelRow, GroupMemberRow, LockRow, MemberInfoRow, Row, Session,
    SessionProvider, Statement, SystemVariable,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_MEMBER_WEIGHT: u8 = 50;

/// One copy of the metadata schema
#[derive(Debug, Clone, PartialEq)]
struct Schema {
    version: SchemaVersion,
    tables: BTreeMap<MetadataTable, BTreeMap<String, serde_json::Value>>,
    /// `(from, to)` DDL hops applied to this copy
    migrations: Vec<(SchemaVersion, SchemaVersion)>,
}

/// Everything that replicates
#[derive(Debug, Clone, Default, PartialEq)]
struct Data {
    gtid: GtidSet,
    live: Option<Schema>,
    backup: Option<Schema>,
    marker: Option<UpgradeState>,
}

#[derive(Debug, Clone)]
struct Channel {
    source: String,
    started: bool,
    paused: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Lock {
    exclusive: bool,
    holders: BTreeSet<u64>,
}

#[derive(Debug)]
struct SimInstance {
    address: String,
    server_uuid: String,
    server_id: u32,
    alive: bool,
    /// Group this instance is currently running group replication in
    group: Option<String>,
    /// Last configured group name, kept after group replication stops
    group_name: Option<String>,
    member_weight: u8,
    data: Data,
    channels: BTreeMap<String, Channel>,
    super_read_only: bool,
    auto_increment: (u32, u32),
    locks: BTreeMap<String, Lock>,
}

#[derive(Debug, Clone)]
struct Group {
    view: Vec<String>,
    view_id: u64,
    multi_primary: bool,
    primary: Option<String>,
}

struct Failpoint {
    address: String,
    matches: Box<dyn Fn(&Statement) -> bool + Send>,
    skip: usize,
}

#[derive(Default)]
struct FleetState {
    instances: BTreeMap<String, SimInstance>,
    groups: BTreeMap<String, Group>,
    next_id: u32,
    next_session: u64,
    next_view: u64,
    failpoints: Vec<Failpoint>,
    mutations: Vec<(String, Statement)>,
}

/// Shared handle to the simulated fleet. Cheap to clone.
#[derive(Clone, Default)]
pub struct Fleet {
    state: Arc<Mutex<FleetState>>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Fleet")
            .field("instances", &state.instances.keys().collect::<Vec<_>>())
            .field("groups", &state.groups)
            .finish()
    }
}

fn statement_error(address: &str, reason: impl Into<String>) -> Error {
    Error::Statement {
        address: address.to_string(),
        reason: reason.into(),
    }
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet with one fresh, standalone instance per address
    pub fn with_instances(addresses: &[&str]) -> Self {
        let fleet = Self::new();
        for address in addresses {
            fleet.add_instance(address);
        }
        fleet
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // === Fleet control ===

    /// Add a fresh instance: alive, no group, `super_read_only` off
    pub fn add_instance(&self, address: &str) {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.instances.insert(
            address.to_string(),
            SimInstance {
                address: address.to_string(),
                server_uuid: uuid::Uuid::from_u128(u128::from(id)).to_string(),
                server_id: id,
                alive: true,
                group: None,
                group_name: None,
                member_weight: DEFAULT_MEMBER_WEIGHT,
                data: Data::default(),
                channels: BTreeMap::new(),
                super_read_only: false,
                auto_increment: (1, 1),
                locks: BTreeMap::new(),
            },
        );
    }

    /// Crash one instance
    pub fn kill(&self, address: &str) {
        self.kill_all(&[address]);
    }

    /// Crash several instances at the same moment. Group members are only
    /// expelled when the survivors keep a majority.
    pub fn kill_all(&self, addresses: &[&str]) {
        let mut state = self.lock();
        let mut affected = BTreeSet::new();
        for address in addresses {
            if let Some(inst) = state.instances.get_mut(*address) {
                inst.alive = false;
                inst.locks.clear();
                if let Some(group) = &inst.group {
                    affected.insert(group.clone());
                }
            }
        }
        for group_name in affected {
            let Some(group) = state.groups.get(&group_name).cloned() else {
                continue;
            };
            let active = state.active_members(&group_name, &group);
            if active.len() * 2 > group.view.len() {
                let old_primary = group.primary.clone();
                let inherit = old_primary
                    .as_ref()
                    .and_then(|p| state.instances.get(p))
                    .map(|p| p.super_read_only)
                    .unwrap_or(false);
                let expelled: Vec<String> = group
                    .view
                    .iter()
                    .filter(|a| !active.contains(*a))
                    .cloned()
                    .collect();
                for address in &expelled {
                    if let Some(inst) = state.instances.get_mut(address) {
                        inst.group = None;
                    }
                }
                state.update_group(&group_name, |g| g.view.retain(|a| active.contains(a)));
                if old_primary.map(|p| expelled.contains(&p)).unwrap_or(false) {
                    state.elect(&group_name, inherit);
                }
            }
        }
        state.replicate();
    }

    /// Bring a crashed instance back: group replication stopped,
    /// `super_read_only` on, data as it was at the crash
    pub fn restart(&self, address: &str) {
        let mut state = self.lock();
        if let Some(inst) = state.instances.get_mut(address) {
            inst.alive = true;
            inst.group = None;
            inst.super_read_only = true;
            for channel in inst.channels.values_mut() {
                channel.started = false;
            }
        }
        state.replicate();
    }

    /// Commit `count` application transactions on `address`
    pub fn write_transactions(&self, address: &str, count: usize) -> Result<()> {
        let mut state = self.lock();
        for _ in 0..count {
            state.write(address, |_| Ok(()))?;
        }
        state.replicate();
        Ok(())
    }

    /// Transactions applied without going through the group, as left
    /// behind by a local maintenance session
    pub fn inject_errant_transactions(&self, address: &str, count: usize) {
        let mut state = self.lock();
        if let Some(inst) = state.instances.get_mut(address) {
            let source = inst.server_uuid.clone();
            for _ in 0..count {
                inst.data.gtid.add_next(&source);
            }
        }
    }

    /// Stop applying on a channel while it keeps reporting as running
    pub fn pause_channel(&self, address: &str, channel: &str, paused: bool) {
        let mut state = self.lock();
        if let Some(ch) = state
            .instances
            .get_mut(address)
            .and_then(|i| i.channels.get_mut(channel))
        {
            ch.paused = paused;
        }
        state.replicate();
    }

    /// Configure and start a channel the orchestrator does not manage
    pub fn add_unmanaged_channel(&self, address: &str, channel: &str, source: &str) {
        let mut state = self.lock();
        if let Some(inst) = state.instances.get_mut(address) {
            inst.channels.insert(
                channel.to_string(),
                Channel {
                    source: source.to_string(),
                    started: true,
                    paused: false,
                    error: None,
                },
            );
        }
        state.replicate();
    }

    /// Fail the `skip + 1`-th statement on `address` matching `matches`
    pub fn fail_on<F>(&self, address: &str, skip: usize, matches: F)
    where
        F: Fn(&Statement) -> bool + Send + 'static,
    {
        self.lock().failpoints.push(Failpoint {
            address: address.to_string(),
            matches: Box::new(matches),
            skip,
        });
    }

    pub fn clear_failpoints(&self) {
        self.lock().failpoints.clear();
    }

    // === Inspection ===

    pub fn is_alive(&self, address: &str) -> bool {
        self.lock()
            .instances
            .get(address)
            .map(|i| i.alive)
            .unwrap_or(false)
    }

    pub fn gtid_executed(&self, address: &str) -> GtidSet {
        self.lock()
            .instances
            .get(address)
            .map(|i| i.data.gtid.clone())
            .unwrap_or_default()
    }

    pub fn super_read_only(&self, address: &str) -> bool {
        self.lock()
            .instances
            .get(address)
            .map(|i| i.super_read_only)
            .unwrap_or(false)
    }

    pub fn auto_increment(&self, address: &str) -> (u32, u32) {
        self.lock()
            .instances
            .get(address)
            .map(|i| i.auto_increment)
            .unwrap_or((1, 1))
    }

    /// Live metadata version, `None` without a metadata schema
    pub fn metadata_version(&self, address: &str) -> Option<SchemaVersion> {
        self.lock()
            .instances
            .get(address)
            .and_then(|i| i.data.live.as_ref().map(|s| s.version))
    }

    pub fn has_metadata_backup(&self, address: &str) -> bool {
        self.lock()
            .instances
            .get(address)
            .map(|i| i.data.backup.is_some())
            .unwrap_or(false)
    }

    pub fn upgrade_marker(&self, address: &str) -> Option<UpgradeState> {
        self.lock()
            .instances
            .get(address)
            .and_then(|i| i.data.marker)
    }

    /// DDL hops applied to the live metadata of `address`
    pub fn applied_migrations(&self, address: &str) -> Vec<(SchemaVersion, SchemaVersion)> {
        self.lock()
            .instances
            .get(address)
            .and_then(|i| i.data.live.as_ref().map(|s| s.migrations.clone()))
            .unwrap_or_default()
    }

    /// Records of one metadata table on `address`, keyed by row id
    pub fn metadata_rows(
        &self,
        address: &str,
        table: MetadataTable,
    ) -> BTreeMap<String, serde_json::Value> {
        self.lock()
            .instances
            .get(address)
            .and_then(|i| i.data.live.as_ref())
            .and_then(|s| s.tables.get(&table).cloned())
            .unwrap_or_default()
    }

    /// Overwrite the live metadata version, bypassing every check
    pub fn force_metadata_version(&self, address: &str, version: SchemaVersion) {
        let mut state = self.lock();
        let Some(group) = state.instances.get(address).and_then(|i| i.group.clone()) else {
            if let Some(schema) = state
                .instances
                .get_mut(address)
                .and_then(|i| i.data.live.as_mut())
            {
                schema.version = version;
            }
            return;
        };
        let members = state.group_view(&group);
        for member in members {
            if let Some(schema) = state
                .instances
                .get_mut(&member)
                .and_then(|i| i.data.live.as_mut())
            {
                schema.version = version;
            }
        }
    }

    /// Advisory locks currently held on `address`
    pub fn held_locks(&self, address: &str) -> Vec<String> {
        self.lock()
            .instances
            .get(address)
            .map(|i| {
                i.locks
                    .iter()
                    .filter(|(_, l)| !l.holders.is_empty())
                    .map(|(n, _)| n.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mutating statements executed so far, in order
    pub fn mutations(&self) -> Vec<(String, Statement)> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    /// Role of `address` in its group, as its own view reports it
    pub fn role(&self, address: &str) -> Option<InstanceRole> {
        let state = self.lock();
        let inst = state.instances.get(address)?;
        let group = state.groups.get(inst.group.as_ref()?)?;
        Some(if group.multi_primary || group.primary.as_deref() == Some(address) {
            InstanceRole::Primary
        } else {
            InstanceRole::Secondary
        })
    }

    fn execute(&self, session: u64, address: &str, statement: &Statement) -> Result<Vec<Row>> {
        let mut state = self.lock();
        if !state.instances.get(address).map(|i| i.alive).unwrap_or(false) {
            return Err(Error::unreachable(address, "connection lost"));
        }
        state.check_failpoint(address, statement)?;
        if statement.is_mutation()
            && !matches!(
                statement,
                Statement::AcquireLock { .. } | Statement::ReleaseLock { .. }
            )
        {
            state
                .mutations
                .push((address.to_string(), statement.clone()));
        }
        let result = state.apply(session, address, statement);
        state.replicate();
        result
    }

    fn close_session(&self, session: u64, address: &str) {
        let mut state = self.lock();
        if let Some(inst) = state.instances.get_mut(address) {
            for lock in inst.locks.values_mut() {
                lock.holders.remove(&session);
            }
        }
    }
}

impl FleetState {
    fn instance(&self, address: &str) -> Result<&SimInstance> {
        self.instances
            .get(address)
            .ok_or_else(|| Error::unreachable(address, "unknown host"))
    }

    fn instance_mut(&mut self, address: &str) -> Result<&mut SimInstance> {
        self.instances
            .get_mut(address)
            .ok_or_else(|| Error::unreachable(address, "unknown host"))
    }

    fn is_active_in(&self, address: &str, group_name: &str) -> bool {
        self.instances
            .get(address)
            .map(|i| i.alive && i.group.as_deref() == Some(group_name))
            .unwrap_or(false)
    }

    fn active_members(&self, group_name: &str, group: &Group) -> Vec<String> {
        group
            .view
            .iter()
            .filter(|a| self.is_active_in(a, group_name))
            .cloned()
            .collect()
    }

    /// Active members of `group_name`
    fn group_view(&self, group_name: &str) -> Vec<String> {
        self.groups
            .get(group_name)
            .map(|g| self.active_members(group_name, g))
            .unwrap_or_default()
    }

    fn has_quorum(&self, group_name: &str) -> bool {
        self.groups
            .get(group_name)
            .map(|g| self.active_members(group_name, g).len() * 2 > g.view.len())
            .unwrap_or(false)
    }

    fn update_group(&mut self, group_name: &str, change: impl FnOnce(&mut Group)) {
        self.next_view += 1;
        let view_id = self.next_view;
        if let Some(group) = self.groups.get_mut(group_name) {
            change(group);
            group.view_id = view_id;
        }
    }

    fn set_sro(&mut self, address: &str, enabled: bool) {
        if let Some(inst) = self.instances.get_mut(address) {
            inst.super_read_only = enabled;
        }
    }

    /// Pick a new primary: highest member weight, then lowest server UUID
    fn elect(&mut self, group_name: &str, super_read_only: bool) {
        let Some(group) = self.groups.get(group_name).cloned() else {
            return;
        };
        if group.multi_primary {
            return;
        }
        let winner = self
            .active_members(group_name, &group)
            .into_iter()
            .filter_map(|a| self.instances.get(&a))
            .max_by(|a, b| {
                a.member_weight
                    .cmp(&b.member_weight)
                    .then_with(|| b.server_uuid.cmp(&a.server_uuid))
            })
            .map(|i| i.address.clone());
        if let Some(group) = self.groups.get_mut(group_name) {
            group.primary = winner.clone();
        }
        if let Some(winner) = winner {
            self.set_sro(&winner, super_read_only);
        }
    }

    fn check_failpoint(&mut self, address: &str, statement: &Statement) -> Result<()> {
        let hit = self
            .failpoints
            .iter_mut()
            .position(|fp| {
                if fp.address != address || !(fp.matches)(statement) {
                    return false;
                }
                if fp.skip > 0 {
                    fp.skip -= 1;
                    return false;
                }
                true
            });
        if let Some(index) = hit {
            self.failpoints.remove(index);
            return Err(statement_error(
                address,
                format!("injected failure on '{}'", statement),
            ));
        }
        Ok(())
    }

    /// Apply one transaction on `address` and copy the result to its group
    fn write<F>(&mut self, address: &str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Data) -> Result<()>,
    {
        let inst = self.instance(address)?;
        if inst.super_read_only {
            return Err(statement_error(
                address,
                "the server is running with super_read_only",
            ));
        }
        let source = match inst.group.clone() {
            Some(group_name) => {
                if !self.has_quorum(&group_name) {
                    return Err(statement_error(
                        address,
                        "group has no quorum; writes are blocked",
                    ));
                }
                let group = self
                    .groups
                    .get(&group_name)
                    .ok_or_else(|| statement_error(address, "group vanished"))?;
                if !group.multi_primary && group.primary.as_deref() != Some(address) {
                    return Err(statement_error(address, "not the group primary"));
                }
                group_name
            }
            None => inst.server_uuid.clone(),
        };

        let inst = self.instance_mut(address)?;
        let mut data = inst.data.clone();
        change(&mut data)?;
        data.gtid.add_next(&source);
        inst.data = data.clone();
        self.spread(address, &data);
        Ok(())
    }

    /// Copy `data` to every active member of the group `address` is in
    fn spread(&mut self, address: &str, data: &Data) {
        let Some(group_name) = self.instances.get(address).and_then(|i| i.group.clone()) else {
            return;
        };
        for member in self.group_view(&group_name) {
            if let Some(inst) = self.instances.get_mut(&member) {
                inst.data = data.clone();
            }
        }
    }

    /// Pull every started channel until nothing changes
    fn replicate(&mut self) {
        for _ in 0..16 {
            let mut changed = false;
            let replicas: Vec<(String, String, String)> = self
                .instances
                .values()
                .filter(|i| i.alive)
                .flat_map(|i| {
                    i.channels
                        .iter()
                        .filter(|(_, c)| c.started && !c.paused && c.error.is_none())
                        .map(|(name, c)| (i.address.clone(), name.clone(), c.source.clone()))
                })
                .collect();

            for (replica, channel, source) in replicas {
                let Some(src) = self.instances.get(&source).filter(|s| s.alive) else {
                    continue;
                };
                let src_data = src.data.clone();
                let Some(dst) = self.instances.get(&replica) else {
                    continue;
                };
                if dst.data == src_data {
                    continue;
                }
                if !src_data.gtid.contains(&dst.data.gtid) {
                    let errant = dst.data.gtid.subtract(&src_data.gtid);
                    if let Some(ch) = self
                        .instances
                        .get_mut(&replica)
                        .and_then(|i| i.channels.get_mut(&channel))
                    {
                        ch.error = Some(format!(
                            "replica has transactions the source does not have: {}",
                            errant
                        ));
                    }
                    continue;
                }
                if let Some(inst) = self.instances.get_mut(&replica) {
                    inst.data = src_data.clone();
                }
                self.spread(&replica, &src_data);
                changed = true;
            }
            if !changed {
                break;
            }
        }
    }

    fn live_schema(&self, address: &str) -> Result<&Schema> {
        self.instance(address)?
            .data
            .live
            .as_ref()
            .ok_or_else(|| statement_error(address, "metadata schema does not exist"))
    }

    fn apply(&mut self, session: u64, address: &str, statement: &Statement) -> Result<Vec<Row>> {
        match statement {
            // === Status reads ===
            Statement::QueryMemberInfo => {
                let inst = self.instance(address)?;
                let group = inst.group.as_ref().and_then(|g| self.groups.get(g));
                let row = MemberInfoRow {
                    server_uuid: inst.server_uuid.clone(),
                    server_id: inst.server_id,
                    address: inst.address.clone(),
                    member_state: if group.is_some() {
                        MemberState::Online
                    } else {
                        MemberState::Offline
                    },
                    group_name: inst.group_name.clone(),
                    view_id: group.map(|g| g.view_id),
                    multi_primary: group.map(|g| g.multi_primary).unwrap_or(false),
                    gtid_executed: inst.data.gtid.clone(),
                    super_read_only: inst.super_read_only,
                    auto_increment_increment: inst.auto_increment.0,
                    auto_increment_offset: inst.auto_increment.1,
                };
                Ok(vec![encode_row(&row)?])
            }
            Statement::QueryGroupMembers => {
                let inst = self.instance(address)?;
                let Some(group_name) = inst.group.clone() else {
                    return Ok(Vec::new());
                };
                let Some(group) = self.groups.get(&group_name) else {
                    return Ok(Vec::new());
                };
                group
                    .view
                    .iter()
                    .map(|member| {
                        let active = self.is_active_in(member, &group_name);
                        let member_id = self
                            .instances
                            .get(member)
                            .map(|i| i.server_uuid.clone())
                            .unwrap_or_default();
                        let role = if group.multi_primary
                            || group.primary.as_deref() == Some(member.as_str())
                        {
                            InstanceRole::Primary
                        } else {
                            InstanceRole::Secondary
                        };
                        encode_row(&GroupMemberRow {
                            member_id,
                            address: member.clone(),
                            state: if active {
                                MemberState::Online
                            } else {
                                MemberState::Unreachable
                            },
                            role: Some(role),
                        })
                    })
                    .collect()
            }
            Statement::QueryReplicationChannels => {
                let inst = self.instance(address)?;
                inst.channels
                    .iter()
                    .map(|(name, c)| {
                        let source_alive = self
                            .instances
                            .get(&c.source)
                            .map(|s| s.alive)
                            .unwrap_or(false);
                        encode_row(&ChannelRow {
                            channel: name.clone(),
                            source: Some(c.source.clone()),
                            io_running: c.started && source_alive,
                            sql_running: c.started && c.error.is_none(),
                            last_error: c.error.clone(),
                        })
                    })
                    .collect()
            }

            // === Group replication ===
            Statement::StartGroupReplication {
                group_name,
                bootstrap,
                multi_primary,
                member_weight,
                ..
            } => {
                self.start_group_replication(address, group_name, *bootstrap, *multi_primary)?;
                let inst = self.instance_mut(address)?;
                inst.member_weight = member_weight.unwrap_or(DEFAULT_MEMBER_WEIGHT);
                Ok(Vec::new())
            }
            Statement::StopGroupReplication => {
                let Some(group_name) = self.instance(address)?.group.clone() else {
                    return Ok(Vec::new());
                };
                let was_primary = self
                    .groups
                    .get(&group_name)
                    .map(|g| g.primary.as_deref() == Some(address))
                    .unwrap_or(false);
                let inherit = self.instance(address)?.super_read_only;
                let inst = self.instance_mut(address)?;
                inst.group = None;
                inst.super_read_only = true;
                self.update_group(&group_name, |g| g.view.retain(|a| a != address));
                if was_primary {
                    self.elect(&group_name, inherit);
                }
                Ok(Vec::new())
            }
            Statement::SetAsPrimary { member_id, .. } => {
                let group_name = self.require_quorum(address)?;
                let target = self.member_by_uuid(&group_name, member_id).ok_or_else(|| {
                    statement_error(address, format!("{} is not an ONLINE member", member_id))
                })?;
                let group = self.groups.get(&group_name).cloned();
                let Some(group) = group.filter(|g| !g.multi_primary) else {
                    return Err(statement_error(address, "group is in multi-primary mode"));
                };
                let old = group.primary.clone();
                let sro = old
                    .as_ref()
                    .and_then(|p| self.instances.get(p))
                    .map(|p| p.super_read_only)
                    .unwrap_or(false);
                if let Some(old) = old.filter(|o| *o != target) {
                    self.set_sro(&old, true);
                }
                self.set_sro(&target, sro);
                if let Some(g) = self.groups.get_mut(&group_name) {
                    g.primary = Some(target);
                }
                Ok(Vec::new())
            }
            Statement::SwitchToMultiPrimary => {
                let group_name = self.require_quorum(address)?;
                let members = self.group_view(&group_name);
                if let Some(g) = self.groups.get_mut(&group_name) {
                    g.multi_primary = true;
                    g.primary = None;
                }
                for member in members {
                    self.set_sro(&member, false);
                }
                Ok(Vec::new())
            }
            Statement::SwitchToSinglePrimary { member_id } => {
                let group_name = self.require_quorum(address)?;
                let members = self.group_view(&group_name);
                let chosen = match member_id {
                    Some(id) => Some(self.member_by_uuid(&group_name, id).ok_or_else(|| {
                        statement_error(address, format!("{} is not an ONLINE member", id))
                    })?),
                    None => None,
                };
                for member in &members {
                    self.set_sro(member, true);
                }
                if let Some(g) = self.groups.get_mut(&group_name) {
                    g.multi_primary = false;
                    g.primary = None;
                }
                match chosen {
                    Some(primary) => {
                        self.set_sro(&primary, false);
                        if let Some(g) = self.groups.get_mut(&group_name) {
                            g.primary = Some(primary);
                        }
                    }
                    None => self.elect(&group_name, false),
                }
                Ok(Vec::new())
            }
            Statement::ForceMembers { addresses } => {
                let group_name = self
                    .instance(address)?
                    .group
                    .clone()
                    .ok_or_else(|| statement_error(address, "group replication is not running"))?;
                for member in addresses {
                    if !self.is_active_in(member, &group_name) {
                        return Err(statement_error(
                            address,
                            format!("{} is not an ONLINE member of the partition", member),
                        ));
                    }
                }
                let group = self.groups.get(&group_name).cloned();
                let primary = group.as_ref().and_then(|g| g.primary.clone());
                for member in self.group_view(&group_name) {
                    if !addresses.contains(&member) {
                        if let Some(inst) = self.instances.get_mut(&member) {
                            inst.group = None;
                        }
                    }
                }
                let keep = addresses.clone();
                self.update_group(&group_name, |g| g.view = keep);
                if primary.map(|p| !addresses.contains(&p)).unwrap_or(true) {
                    self.elect(&group_name, false);
                }
                Ok(Vec::new())
            }
            Statement::SetGlobal { variable, value } => {
                let inst = self.instance_mut(address)?;
                match variable {
                    SystemVariable::SuperReadOnly => inst.super_read_only = *value != 0,
                    SystemVariable::AutoIncrementIncrement => inst.auto_increment.0 = *value,
                    SystemVariable::AutoIncrementOffset => inst.auto_increment.1 = *value,
                }
                Ok(Vec::new())
            }
            Statement::Clone { donor } => {
                if self.instance(address)?.group.is_some() {
                    return Err(statement_error(
                        address,
                        "cannot clone into a running group member",
                    ));
                }
                let donor_data = self
                    .instances
                    .get(donor)
                    .filter(|d| d.alive)
                    .map(|d| d.data.clone())
                    .ok_or_else(|| Error::unreachable(donor, "clone donor is unreachable"))?;
                self.instance_mut(address)?.data = donor_data;
                Ok(Vec::new())
            }

            // === Asynchronous channels ===
            Statement::ChangeReplicationSource { channel, source } => {
                let inst = self.instance_mut(address)?;
                if inst.channels.get(channel).map(|c| c.started).unwrap_or(false) {
                    return Err(statement_error(
                        address,
                        format!("channel '{}' must be stopped first", channel),
                    ));
                }
                inst.channels.insert(
                    channel.clone(),
                    Channel {
                        source: source.clone(),
                        started: false,
                        paused: false,
                        error: None,
                    },
                );
                Ok(Vec::new())
            }
            Statement::StartReplica { channel } => {
                let inst = self.instance_mut(address)?;
                let ch = inst.channels.get_mut(channel).ok_or_else(|| {
                    statement_error(address, format!("channel '{}' does not exist", channel))
                })?;
                ch.started = true;
                ch.error = None;
                Ok(Vec::new())
            }
            Statement::StopReplica { channel } => {
                if let Some(ch) = self.instance_mut(address)?.channels.get_mut(channel) {
                    ch.started = false;
                }
                Ok(Vec::new())
            }
            Statement::ResetReplica { channel } => {
                self.instance_mut(address)?.channels.remove(channel);
                Ok(Vec::new())
            }

            // === Metadata schema ===
            Statement::CreateMetadataSchema { version } => {
                let version = *version;
                self.write(address, |data| {
                    data.live = Some(Schema {
                        version,
                        tables: BTreeMap::new(),
                        migrations: Vec::new(),
                    });
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::DropMetadataSchema => {
                self.write(address, |data| {
                    data.live = None;
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::QueryMetadataSchemas => {
                let data = &self.instance(address)?.data;
                let mut rows = Vec::new();
                if let Some(live) = &data.live {
                    rows.push(encode_row(&SchemaRow {
                        schema: SchemaKind::Live,
                        version: live.version,
                    })?);
                }
                if let Some(backup) = &data.backup {
                    rows.push(encode_row(&SchemaRow {
                        schema: SchemaKind::Backup,
                        version: backup.version,
                    })?);
                }
                Ok(rows)
            }
            Statement::SetMetadataVersion { version } => {
                let version = *version;
                let addr = address.to_string();
                self.write(address, move |data| {
                    let live = data
                        .live
                        .as_mut()
                        .ok_or_else(|| statement_error(&addr, "metadata schema does not exist"))?;
                    live.version = version;
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::MetadataSelect { table } => {
                let schema = self.live_schema(address)?;
                schema
                    .tables
                    .get(table)
                    .map(|rows| {
                        rows.iter()
                            .map(|(key, record)| {
                                encode_row(&RecordRow {
                                    key: key.clone(),
                                    record: record.clone(),
                                })
                            })
                            .collect::<Result<Vec<Row>>>()
                    })
                    .unwrap_or_else(|| Ok(Vec::new()))
            }
            Statement::MetadataCommit { writes } => {
                let addr = address.to_string();
                self.write(address, move |data| {
                    let live = data
                        .live
                        .as_mut()
                        .ok_or_else(|| statement_error(&addr, "metadata schema does not exist"))?;
                    for write in writes {
                        match write {
                            MetadataWrite::Upsert { table, key, record } => {
                                live.tables
                                    .entry(*table)
                                    .or_default()
                                    .insert(key.clone(), record.clone());
                            }
                            MetadataWrite::Delete { table, key } => {
                                if let Some(rows) = live.tables.get_mut(table) {
                                    rows.remove(key);
                                }
                            }
                        }
                    }
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::QueryUpgradeMarker => {
                let marker = self.instance(address)?.data.marker;
                marker
                    .map(|state| encode_row(&MarkerRow { state }).map(|r| vec![r]))
                    .unwrap_or_else(|| Ok(Vec::new()))
            }
            Statement::SetUpgradeMarker { state } => {
                let state = *state;
                self.write(address, move |data| {
                    data.marker = state;
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::BackupMetadataSchema => {
                let addr = address.to_string();
                self.write(address, move |data| {
                    let live = data
                        .live
                        .clone()
                        .ok_or_else(|| statement_error(&addr, "metadata schema does not exist"))?;
                    data.backup = Some(live);
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::RestoreMetadataSchema => {
                let addr = address.to_string();
                self.write(address, move |data| {
                    let backup = data
                        .backup
                        .clone()
                        .ok_or_else(|| statement_error(&addr, "metadata backup does not exist"))?;
                    data.live = Some(backup);
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::DropMetadataBackup => {
                self.write(address, |data| {
                    data.backup = None;
                    Ok(())
                })?;
                Ok(Vec::new())
            }
            Statement::MigrateMetadataSchema { from, to } => {
                let (from, to) = (*from, *to);
                let addr = address.to_string();
                self.write(address, move |data| {
                    let live = data
                        .live
                        .as_mut()
                        .ok_or_else(|| statement_error(&addr, "metadata schema does not exist"))?;
                    if !live.version.is_upgrading() {
                        return Err(statement_error(
                            &addr,
                            "schema DDL requires the upgrading version to be set",
                        ));
                    }
                    if from >= to {
                        return Err(statement_error(
                            &addr,
                            format!("invalid migration {} -> {}", from, to),
                        ));
                    }
                    live.migrations.push((from, to));
                    Ok(())
                })?;
                Ok(Vec::new())
            }

            // === Advisory locks ===
            Statement::AcquireLock { name, exclusive } => {
                let inst = self.instance_mut(address)?;
                let lock = inst.locks.entry(name.clone()).or_default();
                let others = lock.holders.iter().any(|h| *h != session);
                let acquired = if lock.holders.is_empty() {
                    lock.exclusive = *exclusive;
                    true
                } else if !others {
                    lock.exclusive |= *exclusive;
                    true
                } else {
                    !lock.exclusive && !*exclusive
                };
                if acquired {
                    lock.holders.insert(session);
                }
                Ok(vec![encode_row(&LockRow { acquired })?])
            }
            Statement::ReleaseLock { name } => {
                if let Some(lock) = self.instance_mut(address)?.locks.get_mut(name) {
                    lock.holders.remove(&session);
                }
                Ok(Vec::new())
            }
        }
    }

    fn require_quorum(&self, address: &str) -> Result<String> {
        let group_name = self
            .instance(address)?
            .group
            .clone()
            .ok_or_else(|| statement_error(address, "group replication is not running"))?;
        if !self.has_quorum(&group_name) {
            return Err(statement_error(address, "group has no quorum"));
        }
        Ok(group_name)
    }

    fn member_by_uuid(&self, group_name: &str, uuid: &str) -> Option<String> {
        self.group_view(group_name).into_iter().find(|a| {
            self.instances
                .get(a)
                .map(|i| i.server_uuid == uuid)
                .unwrap_or(false)
        })
    }

    fn start_group_replication(
        &mut self,
        address: &str,
        group_name: &str,
        bootstrap: bool,
        multi_primary: bool,
    ) -> Result<()> {
        if self.instance(address)?.group.is_some() {
            return Err(statement_error(address, "group replication is already running"));
        }
        let active = self.group_view(group_name);

        if bootstrap {
            if !active.is_empty() {
                return Err(statement_error(
                    address,
                    format!("group {} is already running on {}", group_name, active.join(",")),
                ));
            }
            self.next_view += 1;
            self.groups.insert(
                group_name.to_string(),
                Group {
                    view: vec![address.to_string()],
                    view_id: self.next_view,
                    multi_primary,
                    primary: (!multi_primary).then(|| address.to_string()),
                },
            );
            let inst = self.instance_mut(address)?;
            inst.group = Some(group_name.to_string());
            inst.group_name = Some(group_name.to_string());
            inst.super_read_only = false;
            return Ok(());
        }

        if !self.has_quorum(group_name) {
            return Err(statement_error(
                address,
                format!("no reachable member of group {} with quorum", group_name),
            ));
        }
        let group = self
            .groups
            .get(group_name)
            .cloned()
            .ok_or_else(|| statement_error(address, "group vanished"))?;
        if group.multi_primary != multi_primary {
            return Err(statement_error(
                address,
                "the joiner's topology mode differs from the group's",
            ));
        }
        let donor = active
            .first()
            .and_then(|a| self.instances.get(a))
            .map(|d| d.data.clone())
            .ok_or_else(|| statement_error(address, "no donor available"))?;
        let own = &self.instance(address)?.data.gtid;
        if !donor.gtid.contains(own) {
            return Err(statement_error(
                address,
                format!(
                    "the joiner has transactions not present in the group: {}",
                    own.subtract(&donor.gtid)
                ),
            ));
        }

        let inst = self.instance_mut(address)?;
        inst.data = donor;
        inst.group = Some(group_name.to_string());
        inst.group_name = Some(group_name.to_string());
        inst.super_read_only = !multi_primary;
        let joiner = address.to_string();
        self.update_group(group_name, |g| {
            if !g.view.contains(&joiner) {
                g.view.push(joiner);
            }
        });
        Ok(())
    }
}

/// Session to one simulated instance
pub struct SimSession {
    fleet: Fleet,
    address: String,
    id: u64,
}

#[async_trait]
impl Session for SimSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.fleet.execute(self.id, &self.address, statement)
    }

    async fn close(&self) {
        self.fleet.close_session(self.id, &self.address);
    }
}

#[async_trait]
impl SessionProvider for Fleet {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Session>> {
        let id = {
            let mut state = self.lock();
            if !state.instances.get(address).map(|i| i.alive).unwrap_or(false) {
                return Err(Error::unreachable(address, "connection refused"));
            }
            state.next_session += 1;
            state.next_session
        };
        Ok(Arc::new(SimSession {
            fleet: self.clone(),
            address: address.to_string(),
            id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::session::decode_rows;

    async fn run(fleet: &Fleet, address: &str, statement: Statement) -> Result<Vec<Row>> {
        let session = fleet.connect(address).await?;
        let rows = session.execute(&statement).await;
        session.close().await;
        rows
    }

    fn start(group: &str, bootstrap: bool) -> Statement {
        Statement::StartGroupReplication {
            group_name: group.into(),
            bootstrap,
            multi_primary: false,
            seeds: Vec::new(),
            member_weight: None,
            exit_state_action: None,
        }
    }

    async fn three_member_group(fleet: &Fleet) {
        run(fleet, "a:3306", start("g1", true)).await.unwrap();
        run(fleet, "b:3306", start("g1", false)).await.unwrap();
        run(fleet, "c:3306", start("g1", false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_bootstrap_and_join() {
        let fleet = Fleet::with_instances(&["a:3306", "b:3306", "c:3306"]);
        three_member_group(&fleet).await;

        let rows: Vec<GroupMemberRow> =
            decode_rows(run(&fleet, "b:3306", Statement::QueryGroupMembers).await.unwrap())
                .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.state == MemberState::Online));
        assert_eq!(fleet.role("a:3306"), Some(InstanceRole::Primary));
        assert!(!fleet.super_read_only("a:3306"));
        assert!(fleet.super_read_only("c:3306"));

        fleet.write_transactions("a:3306", 3).unwrap();
        assert_eq!(fleet.gtid_executed("c:3306").count(), 3);
        assert!(fleet.write_transactions("b:3306", 1).is_err());
    }

    #[tokio::test]
    async fn test_minority_loss_expels_and_reelects() {
        let fleet = Fleet::with_instances(&["a:3306", "b:3306", "c:3306"]);
        three_member_group(&fleet).await;

        fleet.kill("a:3306");
        assert_eq!(fleet.role("b:3306"), Some(InstanceRole::Primary));
        assert!(!fleet.super_read_only("b:3306"));
        fleet.write_transactions("b:3306", 1).unwrap();
    }

    #[tokio::test]
    async fn test_majority_loss_keeps_unreachable_members() {
        let fleet = Fleet::with_instances(&["a:3306", "b:3306", "c:3306"]);
        three_member_group(&fleet).await;

        fleet.kill_all(&["b:3306", "c:3306"]);
        let rows: Vec<GroupMemberRow> =
            decode_rows(run(&fleet, "a:3306", Statement::QueryGroupMembers).await.unwrap())
                .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows.iter().filter(|r| r.state == MemberState::Unreachable).count(),
            2
        );
        assert!(fleet.write_transactions("a:3306", 1).is_err());

        run(
            &fleet,
            "a:3306",
            Statement::ForceMembers {
                addresses: vec!["a:3306".into()],
            },
        )
        .await
        .unwrap();
        fleet.write_transactions("a:3306", 1).unwrap();
    }

    #[tokio::test]
    async fn test_channel_replicates_and_detects_errant() {
        let fleet = Fleet::with_instances(&["a:3306", "r:3306"]);
        fleet.write_transactions("a:3306", 2).unwrap();
        fleet.add_unmanaged_channel("r:3306", "ch", "a:3306");
        assert_eq!(fleet.gtid_executed("r:3306").count(), 2);

        fleet.inject_errant_transactions("r:3306", 1);
        fleet.write_transactions("a:3306", 1).unwrap();
        let rows: Vec<ChannelRow> = decode_rows(
            run(&fleet, "r:3306", Statement::QueryReplicationChannels)
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(rows[0].io_running);
        assert!(!rows[0].sql_running);
        assert!(rows[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_locks_conflict_and_release_on_close() {
        let fleet = Fleet::with_instances(&["a:3306"]);
        let s1 = fleet.connect("a:3306").await.unwrap();
        let s2 = fleet.connect("a:3306").await.unwrap();
        let acquire = |exclusive| Statement::AcquireLock {
            name: "cluster:x".into(),
            exclusive,
        };

        let got: Vec<LockRow> = decode_rows(s1.execute(&acquire(false)).await.unwrap()).unwrap();
        assert!(got[0].acquired);
        let got: Vec<LockRow> = decode_rows(s2.execute(&acquire(false)).await.unwrap()).unwrap();
        assert!(got[0].acquired);
        s2.close().await;
        let got: Vec<LockRow> = decode_rows(s2.execute(&acquire(true)).await.unwrap()).unwrap();
        assert!(!got[0].acquired);

        s1.close().await;
        s1.close().await;
        assert!(fleet.held_locks("a:3306").is_empty());
    }

    #[tokio::test]
    async fn test_failpoint_fires_once() {
        let fleet = Fleet::with_instances(&["a:3306"]);
        fleet.fail_on("a:3306", 1, |s| matches!(s, Statement::DropMetadataBackup));
        assert!(run(&fleet, "a:3306", Statement::DropMetadataBackup).await.is_ok());
        assert!(run(&fleet, "a:3306", Statement::DropMetadataBackup).await.is_err());
        assert!(run(&fleet, "a:3306", Statement::DropMetadataBackup).await.is_ok());
    }
}
