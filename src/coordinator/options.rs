//! Typed options for every operation
//!
//! Each struct lists exactly the options its operation recognizes and is
//! validated before any I/O, so malformed input always fails with
//! [`Error::Argument`].

use crate::common::{validate_address, validate_name, Error, Result};
use crate::topology::model::{ExitStateAction, InstanceOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted `runningTransactionsTimeout`, in seconds
pub const MAX_RUNNING_TRANSACTIONS_TIMEOUT: u32 = 3600;

/// How a joining instance obtains the data it is missing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMethod {
    /// Incremental when the instance's history is a subset of the donor's,
    /// otherwise refuse with `ProvisioningRequired`
    #[default]
    Auto,
    Incremental,
    /// Full copy from a donor, discarding local history
    Clone,
}

impl FromStr for RecoveryMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RecoveryMethod::Auto),
            "incremental" => Ok(RecoveryMethod::Incremental),
            "clone" => Ok(RecoveryMethod::Clone),
            other => Err(Error::Argument(format!(
                "invalid recoveryMethod '{}': expected auto, incremental or clone",
                other
            ))),
        }
    }
}

/// Options shared by every operation that registers a new instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberOptions {
    pub member_weight: Option<u8>,
    pub exit_state_action: Option<ExitStateAction>,
    pub label: Option<String>,
}

impl MemberOptions {
    fn validate(&self) -> Result<()> {
        if let Some(weight) = self.member_weight {
            if weight > 100 {
                return Err(Error::Argument(format!(
                    "memberWeight must be between 0 and 100, got {}",
                    weight
                )));
            }
        }
        if let Some(label) = &self.label {
            validate_name("label", label)?;
        }
        Ok(())
    }

    pub(crate) fn to_instance_options(&self) -> InstanceOptions {
        InstanceOptions {
            member_weight: self.member_weight,
            exit_state_action: self.exit_state_action,
            label: self.label.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateClusterOptions {
    pub multi_primary: bool,
    /// Consensus group UUID; generated when absent
    pub group_name: Option<String>,
    #[serde(flatten)]
    pub member: MemberOptions,
}

impl CreateClusterOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(group) = &self.group_name {
            uuid::Uuid::parse_str(group).map_err(|_| {
                Error::Argument(format!("groupName '{}' is not a valid UUID", group))
            })?;
        }
        self.member.validate()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddInstanceOptions {
    pub recovery_method: RecoveryMethod,
    #[serde(flatten)]
    pub member: MemberOptions,
}

impl AddInstanceOptions {
    pub fn validate(&self) -> Result<()> {
        self.member.validate()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveInstanceOptions {
    /// Remove from metadata even when the instance is unreachable
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RejoinInstanceOptions {
    pub recovery_method: RecoveryMethod,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SetPrimaryInstanceOptions {
    /// Seconds to wait for running transactions before the handover
    pub running_transactions_timeout: Option<u32>,
}

impl SetPrimaryInstanceOptions {
    pub fn validate(&self) -> Result<()> {
        match self.running_transactions_timeout {
            Some(t) if t > MAX_RUNNING_TRANSACTIONS_TIMEOUT => Err(Error::Argument(format!(
                "runningTransactionsTimeout must be between 0 and {}, got {}",
                MAX_RUNNING_TRANSACTIONS_TIMEOUT, t
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootOptions {
    /// Instance to bootstrap from; defaults to the most up-to-date member
    pub primary: Option<String>,
}

impl RebootOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(primary) = &self.primary {
            validate_address(primary)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DissolveOptions {
    /// Proceed even if some members are unreachable
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RescanOptions {
    pub add_unmanaged: bool,
    pub remove_obsolete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaClusterOptions {
    pub recovery_method: RecoveryMethod,
    #[serde(flatten)]
    pub member: MemberOptions,
    pub dry_run: bool,
}

impl ReplicaClusterOptions {
    pub fn validate(&self) -> Result<()> {
        self.member.validate()
    }
}

fn validate_invalidate_list(names: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        validate_name("cluster", name)?;
        if !seen.insert(name.as_str()) {
            return Err(Error::Argument(format!(
                "cluster '{}' is listed more than once in invalidateReplicaClusters",
                name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchoverOptions {
    /// Bound on the replication catch-up wait; the configured sync timeout
    /// applies when absent
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
    pub invalidate_replica_clusters: Vec<String>,
    pub dry_run: bool,
}

impl SwitchoverOptions {
    pub fn validate(&self, target: &str) -> Result<()> {
        validate_name("cluster", target)?;
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::Argument("timeout must be greater than zero".into()));
        }
        validate_invalidate_list(&self.invalidate_replica_clusters)?;
        if self.invalidate_replica_clusters.iter().any(|n| n == target) {
            return Err(Error::Argument(format!(
                "target cluster '{}' cannot be listed in invalidateReplicaClusters",
                target
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverOptions {
    pub invalidate_replica_clusters: Vec<String>,
    pub dry_run: bool,
}

impl FailoverOptions {
    pub fn validate(&self, target: Option<&str>) -> Result<()> {
        validate_invalidate_list(&self.invalidate_replica_clusters)?;
        if let Some(target) = target {
            validate_name("cluster", target)?;
            if self.invalidate_replica_clusters.iter().any(|n| n == target) {
                return Err(Error::Argument(format!(
                    "target cluster '{}' cannot be listed in invalidateReplicaClusters",
                    target
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RejoinClusterOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveClusterOptions {
    /// Remove from metadata only when the cluster is unreachable
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeMetadataOptions {
    pub dry_run: bool,
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    #[test]
    fn test_recovery_method_parse() {
        assert_eq!("CLONE".parse::<RecoveryMethod>().unwrap(), RecoveryMethod::Clone);
        assert_eq!(
            "mysqldump".parse::<RecoveryMethod>().unwrap_err().kind(),
            ErrorKind::ArgumentError
        );
    }

    #[test]
    fn test_create_cluster_options() {
        let mut opts = CreateClusterOptions::default();
        assert!(opts.validate().is_ok());
        opts.group_name = Some("not-a-uuid".into());
        assert!(opts.validate().is_err());
        opts.group_name = Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".into());
        assert!(opts.validate().is_ok());
        opts.member.member_weight = Some(101);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_running_transactions_timeout_bounds() {
        let opts = SetPrimaryInstanceOptions {
            running_transactions_timeout: Some(3601),
        };
        assert!(opts.validate().is_err());
        let opts = SetPrimaryInstanceOptions {
            running_transactions_timeout: Some(0),
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_invalidate_list_validation() {
        let opts = SwitchoverOptions {
            invalidate_replica_clusters: vec!["A".into(), "A".into()],
            ..Default::default()
        };
        assert!(opts.validate("B").is_err());

        let opts = FailoverOptions {
            invalidate_replica_clusters: vec!["R".into()],
            dry_run: false,
        };
        assert!(opts.validate(Some("R")).is_err());
        assert!(opts.validate(None).is_ok());

        let opts = SwitchoverOptions {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(opts.validate("B").is_err());
    }

    #[test]
    fn test_options_from_json() {
        let opts: SwitchoverOptions = serde_json::from_str(
            r#"{"timeout": 30, "invalidate_replica_clusters": ["C"], "dry_run": true}"#,
        )
        .unwrap();
        assert_eq!(opts.timeout, Some(Duration::from_secs(30)));
        assert!(opts.dry_run);
    }
}
