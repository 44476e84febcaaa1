//! Common utilities and types shared across clusterkit

pub mod audit;
pub mod config;
pub mod error;
pub mod utils;
pub mod version;

pub use audit::{AuditEntry, AuditEventType, AuditLogger};
pub use config::{Config, OrchestratorConfig};
pub use error::{Error, ErrorKind, Result};
pub use utils::{
    parse_duration, poll_until, timestamp_now, validate_address, validate_name, Deadline,
};
pub use version::SchemaVersion;
