//! Flat (brute-force) exact store.
//!
//! Embeddings sit in a sealed map shared by `Arc` between clones plus a map
//! of recent inserts, so cloning the store costs only the recent inserts.
//! [`FlatVectorStore::seal`] folds the recent map into the sealed one.

use std::sync::Arc;

use ahash::AHashMap;
use rayon::prelude::*;

use crate::error::{AnchorageError, Result, ensure_dimension};
use crate::exact::ExactBackend;
use crate::item::ItemId;
use crate::spatial::{Accept, Neighbor, sort_neighbors};
use crate::vector::{DistanceMetric, Embedding};

/// Scans at least this large are scored on the rayon pool.
const PARALLEL_SCAN_THRESHOLD: usize = 1024;

/// Embeddings keyed by id, scored by brute force.
#[derive(Debug, Clone)]
pub struct FlatVectorStore {
    dimension: usize,
    metric: DistanceMetric,
    sealed: Arc<AHashMap<ItemId, Embedding>>,
    recent: AHashMap<ItemId, Embedding>,
}

impl FlatVectorStore {
    /// Create an empty store, rejecting dimensions above `max_dimension`.
    pub fn new(dimension: usize, metric: DistanceMetric, max_dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(AnchorageError::invalid_argument(
                "exact store dimension must be positive",
            ));
        }
        if dimension > max_dimension {
            return Err(AnchorageError::invalid_argument(format!(
                "dimension {dimension} exceeds the exact store limit of {max_dimension}"
            )));
        }
        Ok(Self {
            dimension,
            metric,
            sealed: Arc::new(AHashMap::new()),
            recent: AHashMap::new(),
        })
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.sealed.contains_key(&id) || self.recent.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.entries().map(|(id, _)| id)
    }

    fn entries(&self) -> impl Iterator<Item = (ItemId, &Embedding)> + '_ {
        self.sealed
            .iter()
            .chain(self.recent.iter())
            .map(|(id, embedding)| (*id, embedding))
    }

    /// Move recent inserts into the sealed map.
    ///
    /// Copies the sealed map first when another clone still shares it.
    pub fn seal(&mut self) {
        if self.recent.is_empty() {
            return;
        }
        Arc::make_mut(&mut self.sealed).extend(self.recent.drain());
    }

    /// Number of inserts not yet sealed.
    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    fn score<'a, I>(&self, query: &[f32], entries: I) -> Vec<Neighbor>
    where
        I: Iterator<Item = (ItemId, &'a Embedding)>,
    {
        let entries: Vec<(ItemId, &Embedding)> = entries.collect();
        let score = |(id, embedding): &(ItemId, &Embedding)| Neighbor {
            id: *id,
            distance: self.metric.distance_unchecked(query, embedding),
        };
        if entries.len() >= PARALLEL_SCAN_THRESHOLD {
            entries.par_iter().map(score).collect()
        } else {
            entries.iter().map(score).collect()
        }
    }
}

impl ExactBackend for FlatVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn len(&self) -> usize {
        self.sealed.len() + self.recent.len()
    }

    fn insert(&mut self, id: ItemId, embedding: Embedding) -> Result<()> {
        embedding.ensure_dimension(self.dimension)?;
        if self.contains(id) {
            return Err(AnchorageError::index(format!(
                "item {id} is already in the exact store"
            )));
        }
        self.recent.insert(id, embedding);
        Ok(())
    }

    fn remove(&mut self, id: ItemId) -> Option<Embedding> {
        if let Some(embedding) = self.recent.remove(&id) {
            return Some(embedding);
        }
        if !self.sealed.contains_key(&id) {
            return None;
        }
        Arc::make_mut(&mut self.sealed).remove(&id)
    }

    fn get(&self, id: ItemId) -> Option<&Embedding> {
        self.sealed.get(&id).or_else(|| self.recent.get(&id))
    }

    fn distances(&self, query: &[f32], ids: &[ItemId]) -> Result<Vec<Neighbor>> {
        ensure_dimension(self.dimension, query.len())?;
        let entries = ids
            .iter()
            .filter_map(|id| self.get(*id).map(|embedding| (*id, embedding)));
        let mut scored = self.score(query, entries);
        sort_neighbors(&mut scored);
        Ok(scored)
    }

    fn nearest(&self, query: &[f32], k: usize, accept: Accept<'_>) -> Result<Vec<Neighbor>> {
        ensure_dimension(self.dimension, query.len())?;
        let entries = self.entries().filter(|(id, _)| accept(*id));
        let mut scored = self.score(query, entries);
        sort_neighbors(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FlatVectorStore {
        let mut store = FlatVectorStore::new(2, DistanceMetric::Euclidean, 2000).unwrap();
        for (id, p) in [(1u64, [0.0f32, 0.0]), (2, [1.0, 0.0]), (3, [5.0, 5.0]), (4, [5.0, 6.0])] {
            store.insert(id, Embedding::new(p.to_vec()).unwrap()).unwrap();
        }
        store
    }

    #[test]
    fn test_nearest() {
        let store = store();
        let found = store.nearest(&[4.0, 5.0], 2, &|_| true).unwrap();
        assert_eq!(found.iter().map(|n| n.id).collect::<Vec<_>>(), vec![3, 4]);
        assert!((found[0].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut store = store();
        assert!(store.insert(1, Embedding::new(vec![9.0, 9.0]).unwrap()).is_err());
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_distances_skip_unknown_ids() {
        let store = store();
        let found = store.distances(&[0.0, 0.0], &[4, 2, 42]).unwrap();
        assert_eq!(found.iter().map(|n| n.id).collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn test_clones_share_sealed_vectors() {
        let mut store = store();
        store.seal();
        assert_eq!(store.recent_len(), 0);

        let mut next = store.clone();
        next.insert(5, Embedding::new(vec![2.0, 2.0]).unwrap()).unwrap();
        assert!(std::ptr::eq(store.get(1).unwrap(), next.get(1).unwrap()));
        assert_eq!(next.len(), 5);
        assert_eq!(store.len(), 4);
        assert!(!store.contains(5));

        // Removing from a shared sealed map leaves the other clone intact.
        assert!(next.remove(1).is_some());
        assert!(store.get(1).is_some());
        assert!(next.remove(1).is_none());
        assert_eq!(next.nearest(&[2.0, 2.0], 1, &|_| true).unwrap()[0].id, 5);
    }

    #[test]
    fn test_dimension_limits() {
        assert!(FlatVectorStore::new(2001, DistanceMetric::Cosine, 2000).is_err());
        let mut store = store();
        assert!(store.insert(9, Embedding::new(vec![1.0, 2.0, 3.0]).unwrap()).is_err());
        assert!(store.nearest(&[1.0], 1, &|_| true).is_err());
    }

    #[test]
    fn test_large_scan_matches_sequential_order() {
        let mut store = FlatVectorStore::new(4, DistanceMetric::Cosine, 2000).unwrap();
        for id in 0..2000u64 {
            let t = id as f32;
            store
                .insert(id, Embedding::new(vec![t.sin(), t.cos(), 1.0, (t * 0.1).sin()]).unwrap())
                .unwrap();
        }
        let found = store.nearest(&[0.0, 1.0, 1.0, 0.0], 10, &|id| id % 3 != 0).unwrap();
        assert_eq!(found.len(), 10);
        assert!(found.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(found.iter().all(|n| n.id % 3 != 0));
    }
}
