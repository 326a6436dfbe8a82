//! Exact backends over full-dimensional embeddings.
//!
//! The exact stage of the funnel reranks a small candidate set with the true
//! metric, so a flat store with brute-force scoring is the reference backend.

pub mod flat;

use crate::error::Result;
use crate::item::ItemId;
use crate::spatial::{Accept, Neighbor};
use crate::vector::{DistanceMetric, Embedding};

pub use self::flat::FlatVectorStore;

/// k-NN and point distances over full vectors of one dimension.
pub trait ExactBackend: Send + Sync {
    fn dimension(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an embedding. Each id may be stored at most once.
    fn insert(&mut self, id: ItemId, embedding: Embedding) -> Result<()>;

    fn remove(&mut self, id: ItemId) -> Option<Embedding>;

    fn get(&self, id: ItemId) -> Option<&Embedding>;

    /// True distances from `query` to each stored id, sorted by
    /// `(distance, id)`. Unknown ids are skipped.
    fn distances(&self, query: &[f32], ids: &[ItemId]) -> Result<Vec<Neighbor>>;

    /// The `k` nearest accepted embeddings, sorted by `(distance, id)`.
    fn nearest(&self, query: &[f32], k: usize, accept: Accept<'_>) -> Result<Vec<Neighbor>>;
}
