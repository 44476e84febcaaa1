//! Error types for clusterkit

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification every [`Error`] maps onto.
///
/// Callers that only need to decide *what to do next* (fix the input,
/// retry later, rejoin, resync, re-run the upgrade) switch on this instead
/// of on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ArgumentError,
    Unreachable,
    NoQuorum,
    InvalidState,
    ProvisioningRequired,
    Conflict,
    CrashRecoveryRequired,
    Timeout,
    Internal,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Input Errors ===
    #[error("Argument error: {0}")]
    Argument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Connectivity Errors ===
    #[error("Instance {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Statement failed on {address}: {reason}")]
    Statement { address: String, reason: String },

    // === Topology Errors ===
    #[error("Cluster '{cluster}' has no quorum: {detail}")]
    NoQuorum { cluster: String, detail: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Provisioning required for {address}: {reason}")]
    ProvisioningRequired { address: String, reason: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    // === Metadata Errors ===
    #[error("Metadata upgrade requires crash recovery: {0}")]
    CrashRecoveryRequired(String),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Metadata not found: {0}")]
    NotFound(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unreachable(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Unreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn no_quorum(cluster: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::NoQuorum {
            cluster: cluster.into(),
            detail: detail.into(),
        }
    }

    pub fn provisioning(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ProvisioningRequired {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Argument(_) | Error::InvalidConfig(_) => ErrorKind::ArgumentError,
            Error::Unreachable { .. } => ErrorKind::Unreachable,
            Error::NoQuorum { .. } => ErrorKind::NoQuorum,
            Error::InvalidState(_) | Error::NotFound(_) => ErrorKind::InvalidState,
            Error::ProvisioningRequired { .. } => ErrorKind::ProvisioningRequired,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::CrashRecoveryRequired(_) => ErrorKind::CrashRecoveryRequired,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Statement { .. }
            | Error::MetadataCorrupted(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::Argument("bad".into()).kind(),
            ErrorKind::ArgumentError
        );
        assert_eq!(
            Error::unreachable("a:3306", "refused").kind(),
            ErrorKind::Unreachable
        );
        assert_eq!(
            Error::no_quorum("c1", "1/3 online").kind(),
            ErrorKind::NoQuorum
        );
        assert_eq!(
            Error::provisioning("a:3306", "errant").kind(),
            ErrorKind::ProvisioningRequired
        );
        assert_eq!(
            Error::CrashRecoveryRequired("marker".into()).kind(),
            ErrorKind::CrashRecoveryRequired
        );
    }

    #[test]
    fn test_display() {
        let e = Error::no_quorum("prod", "1 of 3 members reachable");
        assert_eq!(
            e.to_string(),
            "Cluster 'prod' has no quorum: 1 of 3 members reachable"
        );
    }
}
