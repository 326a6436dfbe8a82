//! Collections: the user-facing unit that ties anchors, projection, the
//! hybrid index, search and attention together.
//!
//! # Module Structure
//!
//! - `core`: a single-dimension [`Collection`]
//! - `persistence`: save / load through a [`Storage`](crate::storage::Storage)
//! - `partitioned`: one collection per embedding dimension

pub mod core;
pub mod partitioned;
pub mod persistence;

pub use self::core::{Collection, CollectionStats};
pub use self::partitioned::PartitionedCollections;
pub use self::persistence::{CollectionManifest, FORMAT_VERSION, items_name, manifest_name};
