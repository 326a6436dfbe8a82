//! # Anchorage
//!
//! Hybrid spatial/vector retrieval and attention-style selection.
//!
//! ## Features
//!
//! - Projection of high-dimensional embeddings onto distances to a few
//!   well-separated anchors
//! - Coarse and fine kd-trees over projected coordinates plus a flat exact
//!   store, published as immutable snapshots
//! - A coarse -> fine -> exact search funnel with metadata filters
//! - Softmax / inverse-distance attention over search hits, single- and
//!   multi-head
//! - Mergeable streaming aggregates: centroid, log-sum-exp, entropy,
//!   covariance, geometric median
//! - Pluggable blob storage for collection persistence

pub mod aggregate;
pub mod anchor;
pub mod attention;
pub mod collection;
pub mod config;
pub mod error;
pub mod exact;
pub mod generation;
pub mod index;
pub mod item;
pub mod search;
pub mod spatial;
pub mod storage;
pub mod vector;

pub mod prelude {
    pub use crate::anchor::{AnchorSelector, AnchorSet, ProjectedCoordinate, ProjectionEngine};
    pub use crate::attention::{AttentionResult, AttentionSampler, MultiHeadSampler};
    pub use crate::collection::{Collection, PartitionedCollections};
    pub use crate::config::EngineConfig;
    pub use crate::error::{AnchorageError, Result};
    pub use crate::item::{IndexEntry, ItemId, ItemMetadata};
    pub use crate::search::{MetadataFilter, SearchRequest, SearchResults, SearchStatus};
    pub use crate::vector::{DistanceMetric, Embedding};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
