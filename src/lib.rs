//! # clusterkit
//!
//! Orchestrator for clusters of group-replicated database instances and for
//! ClusterSets of such clusters:
//! - Cluster lifecycle: create, add/remove/rejoin members, dissolve
//! - Primary election and single/multi-primary mode switches
//! - Quorum recovery and reboot from complete outage
//! - ClusterSet switchover, failover and rejoin over asynchronous channels
//! - Status aggregation from metadata plus live probes
//! - Crash-recoverable metadata schema upgrades
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Orchestrator                   │
//! │  validate → lock → act → confirm → commit   │
//! └──────┬───────────────┬──────────────────────┘
//!        │ probes        │ metadata (committed last)
//! ┌──────▼──────┐  ┌─────▼──────────────────────┐
//! │ Cluster A   │  │ Cluster B (replica)        │
//! │ PRIMARY R/W │──▶ PRIMARY R/O + channel      │
//! │ 2x SECONDARY│  │ 2x SECONDARY               │
//! └─────────────┘  └────────────────────────────┘
//! ```
//!
//! Instances are reached through the [`topology::SessionProvider`] seam.
//! [`testing::Fleet`] implements it in memory.
//!
//! ## Usage
//!
//! ```no_run
//! use clusterkit::coordinator::{AddInstanceOptions, CreateClusterOptions, Orchestrator};
//! use clusterkit::testing::{fast_config, Fleet};
//! use std::sync::Arc;
//!
//! # async fn demo() -> clusterkit::Result<()> {
//! let fleet = Fleet::with_instances(&["db1:3306", "db2:3306"]);
//! let orch = Orchestrator::new(Arc::new(fleet), fast_config());
//! let cluster = orch
//!     .create_cluster("db1:3306", "main", CreateClusterOptions::default())
//!     .await?;
//! cluster.add_instance("db2:3306", AddInstanceOptions::default()).await?;
//! println!("{}", cluster.status().await?.status);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod metadata;
pub mod ops;
pub mod testing;
pub mod topology;

// Re-export commonly used types
pub use common::{Config, Error, ErrorKind, Result};
pub use coordinator::{Cluster, ClusterSet, OperationReport, Orchestrator};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
