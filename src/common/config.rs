//! Configuration for clusterkit components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "clusterkit.toml";

/// Environment prefix (`CLUSTERKIT__ORCHESTRATOR__PROBE_TIMEOUT_MS=500`)
pub const ENV_PREFIX: &str = "CLUSTERKIT";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrator settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound for connecting to and reading from one instance
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Overall budget of one administrative operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Interval between re-probes while waiting for a topology change
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Replication catch-up wait used when the caller gives none
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// How long to wait for an advisory lock before reporting a conflict
    #[serde(default)]
    pub lock_timeout_ms: u64,

    /// Append-only audit log (JSON lines); disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

fn default_probe_timeout() -> u64 {
    2_000
}
fn default_operation_timeout() -> u64 {
    60_000
}
fn default_poll_interval() -> u64 {
    50
}
fn default_sync_timeout() -> u64 {
    10_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            poll_interval_ms: default_poll_interval(),
            sync_timeout_ms: default_sync_timeout(),
            lock_timeout_ms: 0,
            audit_log: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Reject settings that would make every operation fail or spin
    pub fn validate(&self) -> crate::Result<()> {
        if self.probe_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "probe_timeout_ms must be > 0".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "poll_interval_ms must be > 0".into(),
            ));
        }
        if self.operation_timeout_ms < self.probe_timeout_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "operation_timeout_ms ({}) must not be smaller than probe_timeout_ms ({})",
                self.operation_timeout_ms, self.probe_timeout_ms
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load `clusterkit.toml` from the working directory (if present), then
    /// apply `CLUSTERKIT__*` environment overrides.
    pub fn load() -> crate::Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.orchestrator.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.operation_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[orchestrator]\nprobe_timeout_ms = 500\nsync_timeout_ms = 1500"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.orchestrator.probe_timeout_ms, 500);
        assert_eq!(config.orchestrator.sync_timeout_ms, 1500);
        assert_eq!(config.orchestrator.poll_interval_ms, 50);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/clusterkit.toml")).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.orchestrator.operation_timeout_ms, 60_000);
    }

    #[test]
    fn test_validate_rejects_zero_probe_timeout() {
        let config = OrchestratorConfig {
            probe_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
