//! Primary changes, topology mode switches and rescan

use clusterkit::coordinator::{
    CreateClusterOptions, RescanOptions, SetPrimaryInstanceOptions,
};
use clusterkit::testing::{build_cluster, orchestrator, Fleet};
use clusterkit::topology::{
    ClusterStatus, InstanceRole, Session, SessionProvider, Statement, TopologyMode,
};
use clusterkit::ErrorKind;

const A: &str = "db1:3306";
const B: &str = "db2:3306";
const C: &str = "db3:3306";
const D: &str = "db4:3306";

#[tokio::test]
async fn test_set_primary_instance() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    cluster
        .set_primary_instance(C, SetPrimaryInstanceOptions::default())
        .await
        .unwrap();

    assert_eq!(fleet.role(C), Some(InstanceRole::Primary));
    assert!(!fleet.super_read_only(C));
    assert!(fleet.super_read_only(A));
    let status = cluster.status().await.unwrap();
    assert_eq!(status.primary.as_deref(), Some(C));
    assert_eq!(status.member(C).unwrap().mode, "R/W");

    // Already primary: nothing to do
    let report = cluster
        .set_primary_instance(C, SetPrimaryInstanceOptions::default())
        .await
        .unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_set_primary_instance_refuses_unmanaged_channels() {
    let fleet = Fleet::with_instances(&[A, B, C, D]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.add_unmanaged_channel(B, "reporting", D);

    let err = cluster
        .set_primary_instance(C, SetPrimaryInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(fleet.role(A), Some(InstanceRole::Primary));
}

#[tokio::test]
async fn test_set_primary_instance_validates_timeout() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B]).await.unwrap();

    let err = cluster
        .set_primary_instance(
            B,
            SetPrimaryInstanceOptions {
                running_transactions_timeout: Some(100_000),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentError);
}

#[tokio::test]
async fn test_switch_topology_mode_round_trip() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();

    cluster.switch_to_multi_primary_mode().await.unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.topology_mode, TopologyMode::MultiPrimary);
    assert!(status.members.iter().all(|m| m.mode == "R/W"));
    assert_eq!(fleet.auto_increment(A), (7, 2));
    assert_eq!(fleet.auto_increment(B), (7, 3));

    // Switching again changes nothing
    fleet.clear_mutations();
    let report = cluster.switch_to_multi_primary_mode().await.unwrap();
    assert!(report.is_noop());
    assert!(fleet.mutations().is_empty());
    for address in [A, B, C] {
        let message = format!("{} remains PRIMARY.", address);
        assert!(report.messages.contains(&message), "missing: {}", message);
    }

    // A multi-primary group has no single primary to hand over to
    let err = cluster
        .set_primary_instance(B, SetPrimaryInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    cluster.switch_to_single_primary_mode(Some(B)).await.unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.topology_mode, TopologyMode::SinglePrimary);
    assert_eq!(status.primary.as_deref(), Some(B));
    for address in [A, B, C] {
        assert_eq!(fleet.auto_increment(address), (1, 2));
    }
    assert!(fleet.super_read_only(A));
}

#[tokio::test]
async fn test_mode_switch_needs_every_member_online() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.kill(C);

    let err = cluster.switch_to_multi_primary_mode().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_rescan_clean_cluster() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B]).await.unwrap();

    let report = cluster.rescan(RescanOptions::default()).await.unwrap();
    assert!(report.is_noop());
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn test_rescan_removes_obsolete_members() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    let cluster = build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.kill(C);

    let report = cluster.rescan(RescanOptions::default()).await.unwrap();
    assert!(report.warnings.iter().any(|w| w.contains(C)));
    assert_eq!(cluster.describe().await.unwrap().instances.len(), 3);

    cluster
        .rescan(RescanOptions {
            remove_obsolete: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let status = cluster.status().await.unwrap();
    assert_eq!(status.members.len(), 2);
    assert_eq!(status.status, ClusterStatus::OkNoTolerance);
}

#[tokio::test]
async fn test_rescan_adopts_unmanaged_members() {
    const GROUP: &str = "6e1b8a5c-0d5f-4a1e-9c33-2f7a4b9d1e00";
    let fleet = Fleet::with_instances(&[A, B, D]);
    let orch = orchestrator(&fleet);
    let cluster = orch
        .create_cluster(
            A,
            "main",
            CreateClusterOptions {
                group_name: Some(GROUP.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // D joins the group behind the orchestrator's back
    let session = fleet.connect(D).await.unwrap();
    session
        .execute(&Statement::StartGroupReplication {
            group_name: GROUP.to_string(),
            bootstrap: false,
            multi_primary: false,
            seeds: vec![A.to_string()],
            member_weight: None,
            exit_state_action: None,
        })
        .await
        .unwrap();
    session.close().await;

    let status = cluster.status().await.unwrap();
    let d = status.member(D).unwrap();
    assert!(!d.managed);
    assert!(!d.instance_errors.is_empty());

    cluster
        .rescan(RescanOptions {
            add_unmanaged: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let description = cluster.describe().await.unwrap();
    let d = description
        .instances
        .iter()
        .find(|i| i.address == D)
        .unwrap();
    assert_eq!(d.label.as_deref(), Some(D));
    assert!(cluster.status().await.unwrap().member(D).unwrap().managed);
}

#[tokio::test]
async fn test_rescan_records_new_primary() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.kill(A);

    let cluster = orch.get_cluster(B, None).await.unwrap();
    let report = cluster.rescan(RescanOptions::default()).await.unwrap();
    assert!(report
        .actions
        .iter()
        .any(|a| a == &format!("record {} as the primary", B)));
}
