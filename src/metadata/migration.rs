//! Metadata migration state machine
//!
//! An upgrade walks the durable marker through
//! `NONE -> SETTING_UPGRADE_VERSION -> UPGRADING -> DONE`:
//!
//! 1. copy the live schema to the backup schema
//! 2. marker `SETTING_UPGRADE_VERSION`, live version set to the sentinel
//! 3. marker `UPGRADING`, schema migrated hop by hop and data backfilled
//! 4. marker `DONE`, live version set to the target, backup dropped
//!
//! Whatever happens in between, [`classify`] decides the next action from
//! the marker, the backup and the live schema alone.

use crate::common::{Error, Result, SchemaVersion};
use crate::metadata::schema::UpgradeState;
use crate::metadata::store::SchemaVersions;
use serde::Serialize;
use std::fmt;

/// Versions this build can migrate through, oldest first
pub const KNOWN_VERSIONS: [SchemaVersion; 3] = [
    SchemaVersion::new(1, 0, 1),
    SchemaVersion::new(2, 0, 0),
    SchemaVersion::CURRENT,
];

/// Durable upgrade state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DurableState {
    pub marker: Option<UpgradeState>,
    pub live: Option<SchemaVersion>,
    pub backup: Option<SchemaVersion>,
}

impl DurableState {
    pub fn new(marker: Option<UpgradeState>, versions: SchemaVersions) -> Self {
        Self {
            marker,
            live: versions.live,
            backup: versions.backup,
        }
    }
}

impl fmt::Display for DurableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<SchemaVersion>| {
            v.map(|v| v.to_string())
                .unwrap_or_else(|| "absent".into())
        };
        write!(
            f,
            "marker={}, live={}, backup={}",
            self.marker
                .map(|m| m.to_string())
                .unwrap_or_else(|| "NONE".into()),
            show(self.live),
            show(self.backup)
        )
    }
}

/// What `upgradeMetadata` must do next
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Already at the current version
    UpToDate { drop_stale_backup: bool },
    /// Fresh upgrade from an older version
    Upgrade {
        from: SchemaVersion,
        drop_stale_backup: bool,
    },
    /// Interrupted before data was copied: restore the backup and retry
    RestoreAndRetry { backup: SchemaVersion },
    /// Interrupted before anything was touched: retry from `from`
    Retry { from: SchemaVersion },
    /// Data fully migrated: drop the backup and stamp the target version
    FinishForward { drop_backup: bool },
    /// Live schema is newer than this build
    TooNew { live: SchemaVersion },
    /// Instance has never held metadata
    NoMetadata,
    /// Durable state is inconsistent; an operator has to intervene
    CrashRecoveryRequired { reason: String },
}

/// Decide the next action from durable state alone
pub fn classify(state: &DurableState) -> RecoveryAction {
    let crash = |reason: &str| RecoveryAction::CrashRecoveryRequired {
        reason: format!("{} ({})", reason, state),
    };

    match (state.marker, state.backup, state.live) {
        // Interrupted while preparing or migrating: the backup is the
        // authoritative pre-upgrade copy.
        (Some(UpgradeState::SettingUpgradeVersion | UpgradeState::Upgrading), Some(backup), _) => {
            RecoveryAction::RestoreAndRetry { backup }
        }
        (Some(UpgradeState::SettingUpgradeVersion), None, Some(live)) if !live.is_upgrading() => {
            RecoveryAction::Retry { from: live }
        }
        (Some(UpgradeState::SettingUpgradeVersion), None, _) => {
            crash("upgrade interrupted and no backup of the metadata exists")
        }
        (Some(UpgradeState::Upgrading), None, _) => {
            crash("migration interrupted and the metadata backup is gone")
        }
        (Some(UpgradeState::Done), backup, Some(live)) if live.is_upgrading() => {
            RecoveryAction::FinishForward {
                drop_backup: backup.is_some(),
            }
        }
        (None, None, None) => RecoveryAction::NoMetadata,
        (_, _, None) => crash("live metadata schema is missing"),
        (None | Some(UpgradeState::Done), _, Some(live)) if live.is_upgrading() => {
            crash("metadata carries the upgrading version without an upgrade in progress")
        }
        (None | Some(UpgradeState::Done), backup, Some(live)) => {
            let drop_stale_backup = backup.is_some();
            if live == SchemaVersion::CURRENT {
                RecoveryAction::UpToDate { drop_stale_backup }
            } else if live > SchemaVersion::CURRENT {
                RecoveryAction::TooNew { live }
            } else {
                RecoveryAction::Upgrade {
                    from: live,
                    drop_stale_backup,
                }
            }
        }
    }
}

/// Consecutive `(from, to)` hops from `from` to the current version
pub fn migration_path(from: SchemaVersion) -> Result<Vec<(SchemaVersion, SchemaVersion)>> {
    let start = KNOWN_VERSIONS
        .iter()
        .position(|v| *v == from)
        .ok_or_else(|| {
            Error::InvalidState(format!(
                "no migration path from metadata version {}",
                from
            ))
        })?;
    Ok(KNOWN_VERSIONS[start..]
        .windows(2)
        .map(|w| (w[0], w[1]))
        .collect())
}
