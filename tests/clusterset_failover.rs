//! ClusterSet replication, switchover, failover and rejoin

use clusterkit::coordinator::{
    AddInstanceOptions, ClusterGlobalStatus, ClusterSetGlobalStatus, FailoverOptions,
    RebootOptions, RejoinClusterOptions, RemoveClusterOptions, ReplicaClusterOptions,
    SwitchoverOptions,
};
use clusterkit::testing::{build_clusterset, orchestrator, Fleet};
use clusterkit::topology::{ClusterStatus, CLUSTERSET_CHANNEL};
use clusterkit::{ClusterSet, ErrorKind, Orchestrator};

const P: [&str; 3] = ["p1:3306", "p2:3306", "p3:3306"];
const R: [&str; 3] = ["r1:3306", "r2:3306", "r3:3306"];
const S: [&str; 3] = ["s1:3306", "s2:3306", "s3:3306"];

fn fleet() -> Fleet {
    let addresses: Vec<&str> = P.iter().chain(R.iter()).chain(S.iter()).copied().collect();
    Fleet::with_instances(&addresses)
}

/// P primary, R and S replica clusters
async fn three_clusters(orch: &Orchestrator) -> ClusterSet {
    let set = build_clusterset(orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    set.create_replica_cluster(S[0], "S", ReplicaClusterOptions::default())
        .await
        .unwrap();
    for address in &S[1..] {
        set.cluster("S")
            .add_instance(address, AddInstanceOptions::default())
            .await
            .unwrap();
    }
    set
}

#[tokio::test]
async fn test_replica_cluster_follows_primary() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.write_transactions(P[0], 5).unwrap();

    for address in R {
        assert_eq!(fleet.gtid_executed(address), fleet.gtid_executed(P[0]));
        assert!(fleet.super_read_only(address));
    }

    let status = set.status().await.unwrap();
    assert_eq!(status.status, ClusterSetGlobalStatus::Healthy);
    assert_eq!(status.primary_cluster, "P");
    assert_eq!(status.global_primary_instance.as_deref(), Some(P[0]));
    let replica = status.cluster("R").unwrap();
    assert_eq!(replica.cluster_role, "REPLICA");
    assert_eq!(replica.global_status, ClusterGlobalStatus::Ok);
    assert_eq!(replica.primary.as_deref(), Some(R[0]));
    let channel = replica.channel.as_ref().unwrap();
    assert_eq!(channel.channel, CLUSTERSET_CHANNEL);
    assert_eq!(channel.source.as_deref(), Some(P[0]));

    let description = set.describe().await.unwrap();
    assert_eq!(description.clusters.len(), 2);
}

#[tokio::test]
async fn test_cluster_status_shows_clusterset_role() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();

    let status = set.cluster("R").status().await.unwrap();
    assert_eq!(status.status, ClusterStatus::Ok);
    let membership = status.clusterset.unwrap();
    assert_eq!(membership.domain, "world");
    assert_eq!(membership.cluster_role, "REPLICA");
    assert_eq!(membership.global_primary_instance.as_deref(), Some(P[0]));
    // Replica clusters are read-only end to end
    assert!(status.members.iter().all(|m| m.mode == "R/O"));
}

#[tokio::test]
async fn test_switchover_swaps_roles() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.write_transactions(P[0], 3).unwrap();

    set.set_primary_cluster("R", SwitchoverOptions::default())
        .await
        .unwrap();

    assert!(!fleet.super_read_only(R[0]));
    assert!(fleet.super_read_only(P[0]));
    fleet.write_transactions(R[0], 2).unwrap();
    assert_eq!(fleet.gtid_executed(P[0]), fleet.gtid_executed(R[0]));
    assert!(fleet.held_locks(P[0]).is_empty());
    assert!(fleet.held_locks(R[0]).is_empty());

    let status = set.status().await.unwrap();
    assert_eq!(status.status, ClusterSetGlobalStatus::Healthy);
    assert_eq!(status.primary_cluster, "R");
    assert_eq!(status.generation, 1);
    let old = status.cluster("P").unwrap();
    assert_eq!(old.cluster_role, "REPLICA");
    assert_eq!(
        old.channel.as_ref().and_then(|c| c.source.as_deref()),
        Some(R[0])
    );
}

#[tokio::test]
async fn test_switchover_dry_run_changes_nothing() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.clear_mutations();

    let report = set
        .set_primary_cluster(
            "R",
            SwitchoverOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(report.dry_run);
    assert!(!report.actions.is_empty());
    assert!(fleet.mutations().is_empty());
    assert_eq!(set.status().await.unwrap().primary_cluster, "P");
}

#[tokio::test]
async fn test_switchover_refuses_errant_target() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.inject_errant_transactions(R[0], 1);

    let status = set.status().await.unwrap();
    assert_eq!(status.status, ClusterSetGlobalStatus::Available);
    let replica = status.cluster("R").unwrap();
    assert_eq!(replica.global_status, ClusterGlobalStatus::OkNotConsistent);
    assert!(replica.errant_transactions.is_some());

    let err = set
        .set_primary_cluster("R", SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(!fleet.super_read_only(P[0]));
}

#[tokio::test]
async fn test_switchover_times_out_and_unfences() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.pause_channel(R[0], CLUSTERSET_CHANNEL, true);
    fleet.write_transactions(P[0], 2).unwrap();

    let err = set
        .set_primary_cluster(
            "R",
            SwitchoverOptions {
                timeout: Some(std::time::Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!fleet.super_read_only(P[0]));
    assert_eq!(set.status().await.unwrap().primary_cluster, "P");
}

#[tokio::test]
async fn test_failover_and_rejoin() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();

    fleet.kill_all(&P);
    let survivor = orch.get_clusterset(R[0]).await.unwrap();

    let status = survivor.status().await.unwrap();
    assert_eq!(status.status, ClusterSetGlobalStatus::Unavailable);
    assert!(status.stale);
    assert!(!status.notes.is_empty());

    // A controlled switchover needs a live primary cluster
    let err = survivor
        .set_primary_cluster("R", SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let report = survivor
        .force_primary_cluster(Some("R"), FailoverOptions::default())
        .await
        .unwrap();
    assert!(!report.warnings.is_empty());
    assert!(!fleet.super_read_only(R[0]));

    let status = survivor.status().await.unwrap();
    assert_eq!(status.primary_cluster, "R");
    assert_eq!(
        status.cluster("P").unwrap().global_status,
        ClusterGlobalStatus::Invalidated
    );

    // The old primary cluster comes back fenced and is rejoined as a replica
    for address in P {
        fleet.restart(address);
    }
    fleet.write_transactions(R[0], 2).unwrap();
    survivor
        .rejoin_cluster("P", RejoinClusterOptions::default())
        .await
        .unwrap();

    assert!(fleet.super_read_only(P[0]));
    assert_eq!(fleet.gtid_executed(P[0]), fleet.gtid_executed(R[0]));
    let status = survivor.status().await.unwrap();
    assert_eq!(status.status, ClusterSetGlobalStatus::Healthy);
    assert_eq!(
        status.cluster("P").unwrap().global_status,
        ClusterGlobalStatus::Ok
    );
}

#[tokio::test]
async fn test_failover_refused_while_primary_available() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();

    let err = set
        .force_primary_cluster(None, FailoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_failover_picks_replica_automatically() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.kill_all(&P);

    let survivor = orch.get_clusterset(R[1]).await.unwrap();
    let report = survivor
        .force_primary_cluster(
            None,
            FailoverOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(report.dry_run);
    assert!(report.actions.iter().any(|a| a.contains("'R'")));

    survivor
        .force_primary_cluster(None, FailoverOptions::default())
        .await
        .unwrap();
    assert_eq!(survivor.status().await.unwrap().primary_cluster, "R");
}

#[tokio::test]
async fn test_remove_replica_cluster() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();

    let err = set
        .remove_cluster("P", RemoveClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    set.remove_cluster("R", RemoveClusterOptions::default())
        .await
        .unwrap();

    let description = set.describe().await.unwrap();
    assert_eq!(description.clusters.len(), 1);
    for address in R {
        assert!(fleet.role(address).is_none());
        assert!(fleet.metadata_version(address).is_none());
    }
}

#[tokio::test]
async fn test_rejoin_refuses_diverged_cluster_before_any_change() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.pause_channel(R[0], CLUSTERSET_CHANNEL, true);
    fleet.write_transactions(P[0], 3).unwrap();

    fleet.kill_all(&P);
    let survivor = orch.get_clusterset(R[0]).await.unwrap();
    survivor
        .force_primary_cluster(Some("R"), FailoverOptions::default())
        .await
        .unwrap();
    for address in P {
        fleet.restart(address);
    }
    fleet.clear_mutations();

    let err = survivor
        .rejoin_cluster(
            "P",
            RejoinClusterOptions { dry_run: true },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProvisioningRequired);

    let err = survivor
        .rejoin_cluster("P", RejoinClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProvisioningRequired);
    assert!(fleet.mutations().is_empty());
    assert!(fleet.role(P[0]).is_none());
}

#[tokio::test]
async fn test_switchover_invalidates_listed_replicas() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    let set = three_clusters(&orch).await;
    fleet.kill_all(&S[1..]);

    let err = set
        .set_primary_cluster("P", SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // S lost quorum and must be named before the handover proceeds
    let err = set
        .set_primary_cluster("R", SwitchoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(!fleet.super_read_only(P[0]));

    set.set_primary_cluster(
        "R",
        SwitchoverOptions {
            invalidate_replica_clusters: vec!["S".to_string()],
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let status = set.status().await.unwrap();
    assert_eq!(status.primary_cluster, "R");
    assert_eq!(
        status.cluster("S").unwrap().global_status,
        ClusterGlobalStatus::Invalidated
    );
    assert_eq!(status.cluster("P").unwrap().global_status, ClusterGlobalStatus::Ok);
}

#[tokio::test]
async fn test_failover_preconditions_with_three_clusters() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    three_clusters(&orch).await;
    fleet.kill_all(&P);
    fleet.kill_all(&S[1..]);
    let survivor = orch.get_clusterset(R[0]).await.unwrap();

    let err = survivor
        .force_primary_cluster(Some("P"), FailoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = survivor
        .force_primary_cluster(Some("R"), FailoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(fleet.super_read_only(R[0]));

    survivor
        .force_primary_cluster(
            Some("R"),
            FailoverOptions {
                invalidate_replica_clusters: vec!["S".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let status = survivor.status().await.unwrap();
    assert_eq!(status.primary_cluster, "R");
    for name in ["P", "S"] {
        assert_eq!(
            status.cluster(name).unwrap().global_status,
            ClusterGlobalStatus::Invalidated,
            "{} should be invalidated",
            name
        );
    }
}

#[tokio::test]
async fn test_failover_target_needs_quorum() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    build_clusterset(&orch, "world", ("P", &P[..]), ("R", &R[..]))
        .await
        .unwrap();
    fleet.kill_all(&P);
    fleet.kill_all(&R[1..]);

    let survivor = orch.get_clusterset(R[0]).await.unwrap();
    let err = survivor
        .force_primary_cluster(Some("R"), FailoverOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoQuorum);
    assert!(fleet.super_read_only(R[0]));
}

#[tokio::test]
async fn test_automatic_failover_skips_invalidated_clusters() {
    let fleet = fleet();
    let orch = orchestrator(&fleet);
    three_clusters(&orch).await;

    // Fail over from P to R, then bring P back fenced and invalidated
    fleet.kill_all(&P);
    let survivor = orch.get_clusterset(R[0]).await.unwrap();
    survivor
        .force_primary_cluster(Some("R"), FailoverOptions::default())
        .await
        .unwrap();
    for address in P {
        fleet.restart(address);
    }
    orch.reboot_cluster_from_complete_outage(P[0], Some("P"), RebootOptions::default())
        .await
        .unwrap();
    assert!(fleet.super_read_only(P[0]));
    // P now looks more advanced than S
    fleet.inject_errant_transactions(P[0], 2);

    fleet.kill_all(&R);
    let survivor = orch.get_clusterset(S[0]).await.unwrap();
    survivor
        .force_primary_cluster(None, FailoverOptions::default())
        .await
        .unwrap();

    let status = survivor.status().await.unwrap();
    assert_eq!(status.primary_cluster, "S");
    assert_eq!(
        status.cluster("P").unwrap().global_status,
        ClusterGlobalStatus::Invalidated
    );
}
