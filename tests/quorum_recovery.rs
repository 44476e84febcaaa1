//! Member loss, quorum recovery and reboot from complete outage

use clusterkit::coordinator::{AddInstanceOptions, RebootOptions, RejoinInstanceOptions};
use clusterkit::testing::{build_cluster, orchestrator, Fleet};
use clusterkit::topology::{ClusterStatus, InstanceRole, MemberClassification};
use clusterkit::ErrorKind;

const A: &str = "db1:3306";
const B: &str = "db2:3306";
const C: &str = "db3:3306";
const D: &str = "db4:3306";

#[tokio::test]
async fn test_minority_loss_keeps_quorum() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    fleet.kill(C);
    let status = cluster.status().await.unwrap();
    assert!(status.status.has_quorum());
    assert_eq!(status.status, ClusterStatus::OkNoTolerance);
    assert_ne!(status.member(C).unwrap().status, MemberClassification::Online);
    assert!(!status.member(C).unwrap().instance_errors.is_empty());

    fleet.restart(C);
    cluster
        .rejoin_instance(C, RejoinInstanceOptions::default())
        .await
        .unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.status, ClusterStatus::Ok);
    assert_eq!(status.member(C).unwrap().status, MemberClassification::Online);
}

#[tokio::test]
async fn test_rejoin_online_member_is_noop() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B]).await.unwrap();
    fleet.clear_mutations();

    let report = cluster
        .rejoin_instance(B, RejoinInstanceOptions::default())
        .await
        .unwrap();
    assert!(report.is_noop());
    assert!(fleet.mutations().is_empty());
}

#[tokio::test]
async fn test_primary_loss_elects_new_primary() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    fleet.kill(A);
    let cluster = orch.get_cluster(B, Some("main")).await.unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.primary.as_deref(), Some(B));
    assert_eq!(status.member(B).unwrap().mode, "R/W");
}

#[tokio::test]
async fn test_majority_loss_blocks_changes_until_forced() {
    let fleet = Fleet::with_instances(&[A, B, C, D]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    fleet.kill_all(&[B, C]);
    let status = cluster.status().await.unwrap();
    assert_eq!(status.status, ClusterStatus::NoQuorum);
    assert_eq!(
        status.member(B).unwrap().status,
        MemberClassification::Unreachable
    );

    let err = cluster
        .add_instance(D, AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoQuorum);

    let report = cluster.force_quorum_using_partition_of(A).await.unwrap();
    assert!(!report.warnings.is_empty());
    let status = cluster.status().await.unwrap();
    assert_eq!(status.status, ClusterStatus::OkNoTolerance);
    assert_eq!(status.primary.as_deref(), Some(A));
    for address in [B, C] {
        assert_eq!(
            status.member(address).unwrap().status,
            MemberClassification::Missing
        );
    }

    for address in [B, C] {
        fleet.restart(address);
        cluster
            .rejoin_instance(address, RejoinInstanceOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(cluster.status().await.unwrap().status, ClusterStatus::Ok);
}

#[tokio::test]
async fn test_force_quorum_refused_while_quorum_holds() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    let err = cluster
        .force_quorum_using_partition_of(A)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_rejoin_with_errant_transactions_requires_clone() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    fleet.kill(C);
    fleet.restart(C);
    fleet.inject_errant_transactions(C, 1);

    let err = cluster
        .rejoin_instance(C, RejoinInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProvisioningRequired);
}

#[tokio::test]
async fn test_reboot_from_complete_outage() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.write_transactions(A, 3).unwrap();

    fleet.kill_all(&[A, B, C]);
    for address in [A, B, C] {
        fleet.restart(address);
    }

    let report = orch
        .reboot_cluster_from_complete_outage(B, None, RebootOptions::default())
        .await
        .unwrap();
    assert!(report.actions.iter().any(|a| a.contains("bootstrap")));

    let cluster = orch.get_cluster(B, None).await.unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.status, ClusterStatus::Ok);
    assert_eq!(status.primary.as_deref(), Some(A));
    assert_eq!(fleet.role(C), Some(InstanceRole::Secondary));
}

#[tokio::test]
async fn test_reboot_picks_most_complete_member() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    fleet.kill_all(&[A, B, C]);
    for address in [A, B, C] {
        fleet.restart(address);
    }
    fleet.inject_errant_transactions(B, 1);

    // A is behind B, so it cannot be the seed
    let err = orch
        .reboot_cluster_from_complete_outage(
            A,
            None,
            RebootOptions {
                primary: Some(A.to_string()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    orch.reboot_cluster_from_complete_outage(A, None, RebootOptions::default())
        .await
        .unwrap();
    let status = orch.get_cluster(A, None).await.unwrap().status().await.unwrap();
    assert_eq!(status.primary.as_deref(), Some(B));
    assert_eq!(status.status, ClusterStatus::Ok);
}

#[tokio::test]
async fn test_reboot_refused_while_group_runs() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B]).await.unwrap();

    let err = orch
        .reboot_cluster_from_complete_outage(A, None, RebootOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}
