//! Metadata upgrade, version gating and recovery from interrupted upgrades

use clusterkit::common::SchemaVersion;
use clusterkit::coordinator::{AddInstanceOptions, UpgradeMetadataOptions};
use clusterkit::metadata::{migration_path, UpgradeState, UPGRADE_LOCK};
use clusterkit::testing::{build_cluster, build_clusterset, orchestrator, Fleet};
use clusterkit::topology::{Session, SessionProvider, Statement};
use clusterkit::{ErrorKind, Orchestrator};

const A: &str = "db1:3306";
const B: &str = "db2:3306";
const C: &str = "db3:3306";
const D: &str = "db4:3306";

const OLD: SchemaVersion = SchemaVersion::new(1, 0, 1);

/// Three-member cluster whose metadata was written by an older release
async fn outdated_cluster(fleet: &Fleet) -> Orchestrator {
    let orch = orchestrator(fleet);
    build_cluster(&orch, "main", A, &[B, C]).await.unwrap();
    fleet.force_metadata_version(A, OLD);
    orch
}

fn assert_upgraded(fleet: &Fleet) {
    for address in [A, B, C] {
        assert_eq!(fleet.metadata_version(address), Some(SchemaVersion::CURRENT));
        assert!(!fleet.has_metadata_backup(address));
        assert_eq!(fleet.upgrade_marker(address), Some(UpgradeState::Done));
    }
    assert_eq!(fleet.applied_migrations(A), migration_path(OLD).unwrap());
    assert!(fleet.held_locks(A).is_empty());
}

#[tokio::test]
async fn test_outdated_metadata_is_read_only() {
    let fleet = Fleet::with_instances(&[A, B, C, D]);
    let orch = outdated_cluster(&fleet).await;
    let cluster = orch.get_cluster(A, None).await.unwrap();

    let status = cluster.status().await.unwrap();
    assert_eq!(status.metadata_version, Some(OLD));

    let err = cluster
        .add_instance(D, AddInstanceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_upgrade_dry_run_lists_steps() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = outdated_cluster(&fleet).await;
    fleet.clear_mutations();

    let report = orch
        .upgrade_metadata(B, UpgradeMetadataOptions { dry_run: true })
        .await
        .unwrap();
    assert!(report.dry_run);
    assert!(report.actions.iter().any(|a| a.contains("1.0.1 -> 2.0.0")));
    assert!(fleet.mutations().is_empty());
    assert_eq!(fleet.metadata_version(A), Some(OLD));
}

#[tokio::test]
async fn test_upgrade_from_secondary_runs_on_primary() {
    let fleet = Fleet::with_instances(&[A, B, C, D]);
    let orch = outdated_cluster(&fleet).await;

    let report = orch
        .upgrade_metadata(C, UpgradeMetadataOptions::default())
        .await
        .unwrap();
    assert!(!report.actions.is_empty());
    assert_upgraded(&fleet);

    // Instances registered without a label got their address
    let cluster = orch.get_cluster(A, None).await.unwrap();
    let description = cluster.describe().await.unwrap();
    assert!(description
        .instances
        .iter()
        .all(|i| i.label.as_deref() == Some(i.address.as_str())));

    // Writes are allowed again
    cluster
        .add_instance(D, AddInstanceOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_upgrade_of_current_metadata_is_noop() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B]).await.unwrap();
    fleet.clear_mutations();

    let report = orch
        .upgrade_metadata(A, UpgradeMetadataOptions::default())
        .await
        .unwrap();
    assert!(report.is_noop());
    assert!(fleet.mutations().is_empty());
}

#[tokio::test]
async fn test_newer_metadata_is_refused() {
    let fleet = Fleet::with_instances(&[A, B]);
    let orch = orchestrator(&fleet);
    build_cluster(&orch, "main", A, &[B]).await.unwrap();
    fleet.force_metadata_version(A, SchemaVersion::new(9, 0, 0));

    let err = orch
        .upgrade_metadata(A, UpgradeMetadataOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = orch.get_cluster(A, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_upgrade_refused_while_another_runs() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = outdated_cluster(&fleet).await;

    let other = fleet.connect(A).await.unwrap();
    other
        .execute(&Statement::AcquireLock {
            name: UPGRADE_LOCK.to_string(),
            exclusive: true,
        })
        .await
        .unwrap();

    let err = orch
        .upgrade_metadata(A, UpgradeMetadataOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(fleet.metadata_version(A), Some(OLD));

    other.close().await;
    orch.upgrade_metadata(A, UpgradeMetadataOptions::default())
        .await
        .unwrap();
    assert_upgraded(&fleet);
}

#[tokio::test]
async fn test_interrupted_upgrade_converges() {
    type Matcher = fn(&Statement) -> bool;
    let steps: [(&str, usize, Matcher); 10] = [
        ("backup", 0, |s| matches!(s, Statement::BackupMetadataSchema)),
        ("marker SETTING_UPGRADE_VERSION", 0, |s| {
            matches!(
                s,
                Statement::SetUpgradeMarker {
                    state: Some(UpgradeState::SettingUpgradeVersion)
                }
            )
        }),
        ("sentinel version", 0, |s| {
            matches!(s, Statement::SetMetadataVersion { version } if version.is_upgrading())
        }),
        ("marker UPGRADING", 0, |s| {
            matches!(
                s,
                Statement::SetUpgradeMarker {
                    state: Some(UpgradeState::Upgrading)
                }
            )
        }),
        ("first migration", 0, |s| {
            matches!(s, Statement::MigrateMetadataSchema { .. })
        }),
        ("second migration", 1, |s| {
            matches!(s, Statement::MigrateMetadataSchema { .. })
        }),
        ("label backfill", 0, |s| {
            matches!(s, Statement::MetadataCommit { .. })
        }),
        ("marker DONE", 0, |s| {
            matches!(
                s,
                Statement::SetUpgradeMarker {
                    state: Some(UpgradeState::Done)
                }
            )
        }),
        ("final version", 0, |s| {
            matches!(s, Statement::SetMetadataVersion { version } if *version == SchemaVersion::CURRENT)
        }),
        ("backup drop", 0, |s| matches!(s, Statement::DropMetadataBackup)),
    ];

    for (step, skip, matcher) in steps {
        let fleet = Fleet::with_instances(&[A, B, C]);
        let orch = outdated_cluster(&fleet).await;
        fleet.fail_on(A, skip, matcher);

        let first = orch
            .upgrade_metadata(A, UpgradeMetadataOptions::default())
            .await;
        assert!(first.is_err(), "upgrade survived a failure at {}", step);
        assert!(fleet.held_locks(A).is_empty(), "lock leaked at {}", step);

        orch.upgrade_metadata(A, UpgradeMetadataOptions::default())
            .await
            .unwrap_or_else(|e| panic!("recovery after a failure at {} failed: {}", step, e));
        assert_upgraded(&fleet);
    }
}

#[tokio::test]
async fn test_mid_upgrade_metadata_blocks_operations() {
    let fleet = Fleet::with_instances(&[A, B, C]);
    let orch = outdated_cluster(&fleet).await;
    fleet.fail_on(A, 0, |s| matches!(s, Statement::MigrateMetadataSchema { .. }));
    orch.upgrade_metadata(A, UpgradeMetadataOptions::default())
        .await
        .unwrap_err();

    let err = orch.get_cluster(B, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrashRecoveryRequired);

    let report = orch
        .upgrade_metadata(A, UpgradeMetadataOptions { dry_run: true })
        .await
        .unwrap();
    assert!(report.actions.iter().any(|a| a.starts_with("restore")));
}

#[tokio::test]
async fn test_upgrade_inside_clusterset_targets_global_primary() {
    let p = ["p1:3306", "p2:3306"];
    let r = ["r1:3306", "r2:3306"];
    let addresses: Vec<&str> = p.iter().chain(r.iter()).copied().collect();
    let fleet = Fleet::with_instances(&addresses);
    let orch = orchestrator(&fleet);
    build_clusterset(&orch, "world", ("P", &p[..]), ("R", &r[..]))
        .await
        .unwrap();
    fleet.force_metadata_version(p[0], OLD);

    orch.upgrade_metadata(r[1], UpgradeMetadataOptions::default())
        .await
        .unwrap();

    assert_eq!(fleet.applied_migrations(p[0]), migration_path(OLD).unwrap());
    for address in addresses {
        assert_eq!(fleet.metadata_version(address), Some(SchemaVersion::CURRENT));
    }
}
