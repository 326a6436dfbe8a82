//! The hybrid index of one collection.
//!
//! # Module Structure
//!
//! - `snapshot`: immutable published state (trees, exact store, tombstones)
//! - `hybrid`: staged writes, commit, rebuild and re-projection
//! - `maintenance`: background rebuild worker
//! - `segments`: copy-on-write tables shared between snapshots

pub mod hybrid;
pub mod maintenance;
mod segments;
pub mod snapshot;

pub use self::hybrid::{CommitSummary, HybridIndex, IndexStats};
pub use self::maintenance::{MaintenanceReport, MaintenanceStats, MaintenanceTask, MaintenanceWorker};
pub use self::snapshot::{IndexSnapshot, ItemRecord, MaintenanceReason};
