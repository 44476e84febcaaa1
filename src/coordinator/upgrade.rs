//! `upgradeMetadata`: crash-recoverable metadata schema upgrade
//!
//! Every run starts by reading the durable state (upgrade marker, backup
//! schema, live version) and lets [`classify`] pick the next action, so a
//! run interrupted at any step is finished or rolled back by the next one.

use crate::common::{AuditEventType, Error, Result, SchemaVersion};
use crate::coordinator::options::UpgradeMetadataOptions;
use crate::coordinator::report::OperationReport;
use crate::coordinator::Orchestrator;
use crate::metadata::{
    classify, migration_path, DurableState, HeldLocks, MetadataStore, MetadataTxn,
    RecoveryAction, UpgradeState, UPGRADE_LOCK,
};
use crate::topology::ProbeOutcome;

impl Orchestrator {
    /// Upgrade the metadata reachable through `entry` to the version this
    /// build writes, or finish an upgrade that was interrupted.
    pub async fn upgrade_metadata(
        &self,
        entry: &str,
        opts: UpgradeMetadataOptions,
    ) -> Result<OperationReport> {
        crate::common::validate_address(entry)?;
        let target = self.upgrade_target(entry).await?;

        let probe = match self.probe(&target).await {
            ProbeOutcome::Reachable(r) => r,
            ProbeOutcome::Unreachable { address, reason } => {
                return Err(Error::unreachable(address, reason))
            }
        };
        if probe.super_read_only {
            return Err(Error::InvalidState(format!(
                "{} is read-only; upgradeMetadata must run on a writable primary",
                target
            )));
        }

        let instance = self.connect(&target).await?;
        let store = MetadataStore::new(instance.clone());
        let state = match read_state(&store).await {
            Ok(state) => state,
            Err(e) => {
                instance.close().await;
                return Err(e);
            }
        };
        let action = classify(&state);
        tracing::info!("Metadata on {}: {} -> {:?}", target, state, action);

        let mut report = OperationReport::new("upgradeMetadata").with_dry_run(opts.dry_run);
        if let Err(e) = check_action(&action) {
            instance.close().await;
            return Err(e);
        }
        if opts.dry_run {
            plan(&action, &mut report);
            instance.close().await;
            return Ok(report);
        }

        let mut locks = HeldLocks::new();
        if let Err(e) = self
            .lock(&mut locks, &instance, &[(UPGRADE_LOCK.to_string(), true)])
            .await
        {
            locks.release().await;
            instance.close().await;
            return Err(e);
        }

        // Another run may have finished while this one waited for the lock.
        let result = async {
            let state = read_state(&store).await?;
            let action = classify(&state);
            check_action(&action)?;
            run(&store, &action, &mut report).await
        }
        .await;
        locks.release().await;
        let final_version = result?;

        report.info(format!(
            "Metadata on {} is at version {}.",
            target, final_version
        ));
        self.audit().log_event(
            AuditEventType::MetadataUpgraded,
            "orchestrator",
            Some(target.clone()),
            format!("metadata at {}", final_version),
            serde_json::to_value(&action).ok(),
        );
        Ok(report)
    }

    /// The instance holding the authoritative metadata for `entry`: the
    /// global primary inside a ClusterSet, the group primary otherwise.
    async fn upgrade_target(&self, entry: &str) -> Result<String> {
        let probe = match self.probe(entry).await {
            ProbeOutcome::Reachable(r) => r,
            ProbeOutcome::Unreachable { address, reason } => {
                return Err(Error::unreachable(address, reason))
            }
        };
        let mut target = match (probe.multi_primary, probe.view_primary()) {
            (false, Some(primary)) => primary.address.clone(),
            _ => entry.to_string(),
        };

        // Mid-upgrade metadata is still loadable; only the version gate
        // refuses it.
        if let Ok(resolved) = self.resolve_metadata(&target).await {
            if let Some(set) = resolved.clusterset() {
                if let Ok(view) = self
                    .cluster_view(&resolved.snapshot, &set.primary_cluster)
                    .await
                {
                    if let Some(primary) = view.primary() {
                        target = primary.to_string();
                    }
                }
            }
        }
        Ok(target)
    }
}

async fn read_state(store: &MetadataStore) -> Result<DurableState> {
    Ok(DurableState::new(
        store.upgrade_marker().await?,
        store.schema_versions().await?,
    ))
}

/// Map the actions that cannot proceed to errors
fn check_action(action: &RecoveryAction) -> Result<()> {
    match action {
        RecoveryAction::TooNew { live } => Err(Error::InvalidState(format!(
            "metadata version {} is newer than the supported {}",
            live,
            SchemaVersion::CURRENT
        ))),
        RecoveryAction::NoMetadata => Err(Error::NotFound(
            "no metadata schema to upgrade".to_string(),
        )),
        RecoveryAction::CrashRecoveryRequired { reason } => {
            Err(Error::CrashRecoveryRequired(reason.clone()))
        }
        _ => Ok(()),
    }
}

fn plan(action: &RecoveryAction, report: &mut OperationReport) {
    match action {
        RecoveryAction::UpToDate { drop_stale_backup } => {
            if *drop_stale_backup {
                report.action("drop the leftover metadata backup");
            }
            report.info(format!(
                "Metadata is already at version {}.",
                SchemaVersion::CURRENT
            ));
        }
        RecoveryAction::Upgrade { from, .. } | RecoveryAction::Retry { from } => {
            plan_upgrade(*from, report)
        }
        RecoveryAction::RestoreAndRetry { backup } => {
            report.action(format!("restore metadata {} from the backup", backup));
            plan_upgrade(*backup, report);
        }
        RecoveryAction::FinishForward { drop_backup } => {
            report.action(format!("set metadata version {}", SchemaVersion::CURRENT));
            if *drop_backup {
                report.action("drop the metadata backup");
            }
        }
        RecoveryAction::TooNew { .. }
        | RecoveryAction::NoMetadata
        | RecoveryAction::CrashRecoveryRequired { .. } => {}
    }
}

fn plan_upgrade(from: SchemaVersion, report: &mut OperationReport) {
    report.action("back up the metadata schema");
    report.action(format!("set upgrade marker {}", UpgradeState::SettingUpgradeVersion));
    report.action(format!("set metadata version {}", SchemaVersion::UPGRADING));
    report.action(format!("set upgrade marker {}", UpgradeState::Upgrading));
    match migration_path(from) {
        Ok(path) => {
            for (f, t) in path {
                report.action(format!("migrate metadata {} -> {}", f, t));
            }
        }
        Err(e) => report.warn(e.to_string()),
    }
    report.action("backfill default instance labels");
    report.action(format!("set upgrade marker {}", UpgradeState::Done));
    report.action(format!("set metadata version {}", SchemaVersion::CURRENT));
    report.action("drop the metadata backup");
}

/// Carry out `action`; returns the final live version
async fn run(
    store: &MetadataStore,
    action: &RecoveryAction,
    report: &mut OperationReport,
) -> Result<SchemaVersion> {
    match action {
        RecoveryAction::UpToDate { drop_stale_backup } => {
            if *drop_stale_backup {
                store.drop_backup().await?;
                report.action("drop the leftover metadata backup");
            }
            report.info(format!(
                "Metadata is already at version {}.",
                SchemaVersion::CURRENT
            ));
        }
        RecoveryAction::Upgrade { from, .. } | RecoveryAction::Retry { from } => {
            upgrade(store, *from, report).await?;
        }
        RecoveryAction::RestoreAndRetry { backup } => {
            report.warn(format!(
                "A previous upgrade was interrupted; restoring metadata {} from the backup.",
                backup
            ));
            store.restore_backup().await?;
            report.action(format!("restore metadata {} from the backup", backup));
            upgrade(store, *backup, report).await?;
        }
        RecoveryAction::FinishForward { drop_backup } => {
            report.info("A previous upgrade migrated all data; finishing it.");
            finish(store, *drop_backup, report).await?;
        }
        RecoveryAction::TooNew { .. }
        | RecoveryAction::NoMetadata
        | RecoveryAction::CrashRecoveryRequired { .. } => check_action(action)?,
    }
    Ok(SchemaVersion::CURRENT)
}

async fn upgrade(
    store: &MetadataStore,
    from: SchemaVersion,
    report: &mut OperationReport,
) -> Result<()> {
    let path = migration_path(from)?;

    store.backup().await?;
    report.action("back up the metadata schema");
    store
        .set_upgrade_marker(Some(UpgradeState::SettingUpgradeVersion))
        .await?;
    report.action(format!("set upgrade marker {}", UpgradeState::SettingUpgradeVersion));
    store.set_version(SchemaVersion::UPGRADING).await?;
    report.action(format!("set metadata version {}", SchemaVersion::UPGRADING));
    store.set_upgrade_marker(Some(UpgradeState::Upgrading)).await?;
    report.action(format!("set upgrade marker {}", UpgradeState::Upgrading));

    for (f, t) in path {
        store.migrate(f, t).await?;
        report.action(format!("migrate metadata {} -> {}", f, t));
    }
    let labelled = backfill_labels(store).await?;
    report.action(format!("backfill default labels for {} instance(s)", labelled));

    store.set_upgrade_marker(Some(UpgradeState::Done)).await?;
    report.action(format!("set upgrade marker {}", UpgradeState::Done));
    finish(store, true, report).await
}

async fn finish(
    store: &MetadataStore,
    drop_backup: bool,
    report: &mut OperationReport,
) -> Result<()> {
    store.set_version(SchemaVersion::CURRENT).await?;
    report.action(format!("set metadata version {}", SchemaVersion::CURRENT));
    if drop_backup {
        store.drop_backup().await?;
        report.action("drop the metadata backup");
    }
    Ok(())
}

/// Instances registered before labels existed get their address as label
async fn backfill_labels(store: &MetadataStore) -> Result<usize> {
    let snapshot = store.load().await?;
    let mut txn = MetadataTxn::new();
    let mut count = 0;
    for instance in &snapshot.instances {
        if instance.options.label.is_none() {
            let mut record = instance.clone();
            record.options.label = Some(record.address.clone());
            txn.put_instance(&record)?;
            count += 1;
        }
    }
    store.commit(txn).await?;
    Ok(count)
}
