//! Advisory operation locks
//!
//! Locks are named, shared or exclusive, and held by the session that took
//! them. Acquisition never waits: a lock already held in a conflicting mode
//! fails immediately with [`Error::Conflict`].

use crate::common::{Error, Result};
use crate::topology::instance::Instance;
use crate::topology::session::{decode_rows, LockRow, Statement};
use std::sync::Arc;

/// Serializes `upgradeMetadata` runs
pub const UPGRADE_LOCK: &str = "metadata-upgrade";

pub fn cluster_lock(cluster_id: &str) -> String {
    format!("cluster:{}", cluster_id)
}

pub fn clusterset_lock(clusterset_id: &str) -> String {
    format!("clusterset:{}", clusterset_id)
}

/// Locks taken by one operation, released together
#[derive(Debug, Default)]
pub struct HeldLocks {
    held: Vec<(Instance, String)>,
}

impl HeldLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Take `name` on `instance`. On conflict every lock already held by
    /// this set is kept; the caller releases them.
    pub async fn acquire(
        &mut self,
        instance: &Instance,
        name: &str,
        exclusive: bool,
    ) -> Result<()> {
        let rows: Vec<LockRow> = decode_rows(
            instance
                .execute(Statement::AcquireLock {
                    name: name.to_string(),
                    exclusive,
                })
                .await?,
        )?;
        let acquired = rows.first().map(|r| r.acquired).unwrap_or(false);
        if !acquired {
            return Err(Error::Conflict(format!(
                "lock '{}' on {} is held by another operation",
                name,
                instance.address()
            )));
        }
        tracing::debug!(
            "Acquired {} lock '{}' on {}",
            if exclusive { "exclusive" } else { "shared" },
            name,
            instance.address()
        );
        self.held.push((instance.clone(), name.to_string()));
        Ok(())
    }

    /// Release in reverse acquisition order, then close the sessions that
    /// held them. Failures are logged; a lock is dropped anyway when its
    /// session closes.
    pub async fn release(mut self) {
        let mut sessions: Vec<Instance> = Vec::new();
        while let Some((instance, name)) = self.held.pop() {
            if let Err(e) = instance
                .execute(Statement::ReleaseLock { name: name.clone() })
                .await
            {
                tracing::warn!(
                    "Failed to release lock '{}' on {}: {}",
                    name,
                    instance.address(),
                    e
                );
            }
            if !sessions
                .iter()
                .any(|s| Arc::ptr_eq(s.session(), instance.session()))
            {
                sessions.push(instance);
            }
        }
        for instance in sessions {
            instance.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_names() {
        assert_eq!(cluster_lock("c1"), "cluster:c1");
        assert_eq!(clusterset_lock("cs1"), "clusterset:cs1");
    }
}
