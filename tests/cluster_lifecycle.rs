//! Cluster lifecycle on a simulated fleet: create, add, remove, dissolve

use clusterkit::coordinator::{
    AddInstanceOptions, CreateClusterOptions, DissolveOptions, MemberOptions, RecoveryMethod,
    RemoveInstanceOptions,
};
use clusterkit::testing::{build_cluster, orchestrator, Fleet};
use clusterkit::topology::{ClusterStatus, InstanceRole, MemberClassification};
use clusterkit::ErrorKind;

const A: &str = "db1:3306";
const B: &str = "db2:3306";
const C: &str = "db3:3306";
const D: &str = "db4:3306";

#[tokio::test]
async fn test_create_cluster_and_add_instances() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    let status = cluster.status().await.unwrap();
    assert_eq!(status.cluster_name, "main");
    assert_eq!(status.status, ClusterStatus::Ok);
    assert_eq!(status.primary.as_deref(), Some(A));
    assert_eq!(status.members.len(), 3);
    assert!(status
        .members
        .iter()
        .all(|m| m.managed && m.status == MemberClassification::Online));
    assert_eq!(status.member(A).unwrap().mode, "R/W");
    assert_eq!(status.member(B).unwrap().mode, "R/O");
    assert_eq!(status.member(C).unwrap().role, Some(InstanceRole::Secondary));

    // Metadata reached every member and no lock was left behind
    assert_eq!(fleet.gtid_executed(A), fleet.gtid_executed(C));
    assert!(fleet.held_locks(A).is_empty());
    assert_eq!(cluster.describe().await.unwrap().instances.len(), 3);
}

#[tokio::test]
async fn test_create_cluster_rejects_existing_metadata() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[]).await.unwrap();

    let err = orch
        .create_cluster(A, "other", CreateClusterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_add_instance_twice_is_rejected() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B]).await.unwrap();

    let err = cluster
        .add_instance(B, AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_errant_transactions_require_clone() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[]).await.unwrap();
    fleet.inject_errant_transactions(B, 2);

    let err = cluster
        .add_instance(B, AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProvisioningRequired);
    assert!(fleet.role(B).is_none());

    let report = cluster
        .add_instance(
            B,
            AddInstanceOptions {
                recovery_method: RecoveryMethod::Clone,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(report.actions.iter().any(|a| a.starts_with("clone")));
    assert_eq!(fleet.role(B), Some(InstanceRole::Secondary));
    assert_eq!(fleet.gtid_executed(A), fleet.gtid_executed(B));
}

#[tokio::test]
async fn test_member_options_are_recorded() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[]).await.unwrap();
    cluster
        .add_instance(
            B,
            AddInstanceOptions {
                member: MemberOptions {
                    member_weight: Some(80),
                    label: Some("reporting".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let description = cluster.describe().await.unwrap();
    let b = description
        .instances
        .iter()
        .find(|i| i.address == B)
        .unwrap();
    assert_eq!(b.label.as_deref(), Some("reporting"));
    assert_eq!(b.member_weight, Some(80));
}

#[tokio::test]
async fn test_remove_secondary() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    cluster
        .remove_instance(C, RemoveInstanceOptions::default())
        .await
        .unwrap();

    let status = cluster.status().await.unwrap();
    assert_eq!(status.members.len(), 2);
    assert!(status.member(C).is_none());
    assert!(fleet.role(C).is_none());
    assert!(fleet.super_read_only(C));
}

#[tokio::test]
async fn test_remove_primary_hands_over() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    cluster
        .remove_instance(A, RemoveInstanceOptions::default())
        .await
        .unwrap();

    // Reach the cluster through a surviving member from now on
    let cluster = orch.get_cluster(B, None).await.unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.primary.as_deref(), Some(B));
    assert_eq!(status.members.len(), 2);
    assert!(!fleet.super_read_only(B));
}

#[tokio::test]
async fn test_remove_unreachable_member_needs_force() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.kill(C);

    let err = cluster
        .remove_instance(C, RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unreachable);

    let report = cluster
        .remove_instance(C, RemoveInstanceOptions { force: true })
        .await
        .unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(cluster.status().await.unwrap().status, ClusterStatus::OkNoTolerance);
}

#[tokio::test]
async fn test_last_member_cannot_be_removed() {
    let fleet = Fleet::with_instances(&[A]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[]).await.unwrap();

    let err = cluster
        .remove_instance(A, RemoveInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_dissolve_stops_every_member() {
    let fleet = Fleet::with_instances(&[A, B, C, D]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    cluster.dissolve(DissolveOptions::default()).await.unwrap();

    for address in [A, B, C] {
        assert!(fleet.role(address).is_none(), "{} still in a group", address);
        assert!(fleet.metadata_version(address).is_none());
    }

    // The instances can be used for a new cluster right away
    build_cluster(&orch, "again", B, &[A]).await.unwrap();
}
