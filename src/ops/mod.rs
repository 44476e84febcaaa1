//! Maintenance commands for clusters

pub mod rescan;

pub use rescan::RescanFindings;
