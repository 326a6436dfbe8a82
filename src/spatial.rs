//! Spatial backends over low-dimensional projected coordinates.
//!
//! Distances in projected space are Euclidean over the coordinate values,
//! regardless of the metric the coordinates were computed with.

pub mod kdtree;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::item::ItemId;

pub use self::kdtree::KdTree;

/// Predicate deciding whether an item may be returned (tombstones, filters).
pub type Accept<'a> = &'a (dyn Fn(ItemId) -> bool + Sync);

/// An item and its distance from the query point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: ItemId,
    pub distance: f32,
}

/// Items gathered by visiting whole cells nearest-first.
#[derive(Debug, Clone, Default)]
pub struct CellScan {
    /// Accepted items of every visited cell, sorted by `(distance, id)`.
    pub candidates: Vec<Neighbor>,
    pub cells_visited: usize,
    /// Every cell of the structure was visited.
    pub exhausted: bool,
}

/// Range and k-NN queries over points of one fixed arity.
pub trait SpatialBackend: Send + Sync {
    /// Arity of the stored points.
    fn dimension(&self) -> usize;

    /// Number of stored points, accepted or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a point.
    fn insert(&mut self, id: ItemId, point: &[f32]) -> Result<()>;

    /// The `k` nearest accepted points, sorted by `(distance, id)`.
    fn nearest(&self, point: &[f32], k: usize, accept: Accept<'_>) -> Result<Vec<Neighbor>>;

    /// Every accepted point within `radius`, sorted by `(distance, id)`.
    fn within_radius(&self, point: &[f32], radius: f32, accept: Accept<'_>)
    -> Result<Vec<Neighbor>>;

    /// Visit cells nearest-first until `max_points` accepted points have been
    /// gathered or `max_cells` cells have been visited.
    fn collect_cells(
        &self,
        point: &[f32],
        max_points: usize,
        max_cells: usize,
        accept: Accept<'_>,
    ) -> Result<CellScan>;
}

/// Sort neighbors by distance, then id.
pub(crate) fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
}
