//! Topology metadata: schema layout, store, operation locks and upgrades

pub mod lock;
pub mod migration;
pub mod schema;
pub mod store;

pub use lock::{cluster_lock, clusterset_lock, HeldLocks, UPGRADE_LOCK};
pub use migration::{classify, migration_path, DurableState, RecoveryAction};
pub use schema::{MetadataTable, MetadataWrite, UpgradeState};
pub use store::{gate_version, MetadataSnapshot, MetadataStore, MetadataTxn, SchemaVersions};
