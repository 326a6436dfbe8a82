//! Anchors and distance-to-anchor projection.
//!
//! An [`AnchorSet`] is a small, versioned set of reference embeddings. The
//! [`ProjectionEngine`] maps any embedding of the same dimension to a
//! [`ProjectedCoordinate`] holding its distance to each anchor, which is what
//! the spatial tiers of the index operate on.
//!
//! # Module Structure
//!
//! - `set`: anchor sets and projected coordinates
//! - `selector`: greedy farthest-point anchor selection
//! - `projection`: embedding -> coordinate mapping
//! - `registry`: the current anchor set of a collection and its history

pub mod projection;
pub mod registry;
pub mod selector;
pub mod set;

pub use self::projection::ProjectionEngine;
pub use self::registry::AnchorRegistry;
pub use self::selector::{AnchorSelection, AnchorSelector};
pub use self::set::{AnchorSet, ProjectedCoordinate};
