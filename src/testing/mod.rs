//! Simulated fleet and helpers for tests and demos
//!
//! Nothing here talks to a real server. [`Fleet`] stands in for a set of
//! database instances behind the [`SessionProvider`] seam, so every
//! operation can run end to end in-process.
//!
//! [`SessionProvider`]: crate::topology::SessionProvider

pub mod sim;

pub use sim::{Fleet, SimSession};

use crate::common::{OrchestratorConfig, Result};
use crate::coordinator::{
    AddInstanceOptions, Cluster, ClusterSet, CreateClusterOptions, Orchestrator,
    ReplicaClusterOptions,
};
use std::sync::Arc;

/// Timeouts short enough for a simulated fleet
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        probe_timeout_ms: 500,
        operation_timeout_ms: 5_000,
        poll_interval_ms: 5,
        sync_timeout_ms: 500,
        lock_timeout_ms: 0,
        audit_log: None,
    }
}

/// Orchestrator driving `fleet` with [`fast_config`]
pub fn orchestrator(fleet: &Fleet) -> Orchestrator {
    Orchestrator::new(Arc::new(fleet.clone()), fast_config())
}

/// Single-primary cluster `name` with `seed` as primary and every other
/// address added as a secondary
pub async fn build_cluster(
    orch: &Orchestrator,
    name: &str,
    seed: &str,
    others: &[&str],
) -> Result<Cluster> {
    let cluster = orch
        .create_cluster(seed, name, CreateClusterOptions::default())
        .await?;
    for address in others {
        cluster
            .add_instance(address, AddInstanceOptions::default())
            .await?;
    }
    Ok(cluster)
}

/// ClusterSet `domain` with primary cluster `primary` (seed first) and one
/// replica cluster `replica` (seed first)
pub async fn build_clusterset(
    orch: &Orchestrator,
    domain: &str,
    primary: (&str, &[&str]),
    replica: (&str, &[&str]),
) -> Result<ClusterSet> {
    let (primary_name, primary_members) = primary;
    let (replica_name, replica_members) = replica;
    let (seed, others) = primary_members
        .split_first()
        .ok_or_else(|| crate::Error::Argument("primary cluster needs members".into()))?;
    let cluster = build_cluster(orch, primary_name, seed, others).await?;
    let set = cluster.create_clusterset(domain).await?;

    let (seed, others) = replica_members
        .split_first()
        .ok_or_else(|| crate::Error::Argument("replica cluster needs members".into()))?;
    set.create_replica_cluster(seed, replica_name, ReplicaClusterOptions::default())
        .await?;
    let replica = set.cluster(replica_name);
    for address in others {
        replica
            .add_instance(address, AddInstanceOptions::default())
            .await?;
    }
    Ok(set)
}
