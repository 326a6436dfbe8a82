//! Greedy farthest-point anchor selection.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::aggregate::{CentroidAggregator, StreamingAggregator};
use crate::config::{AnchorConfig, SeedStrategy};
use crate::error::{AnchorageError, Result, ensure_dimension};
use crate::vector::{DistanceMetric, Embedding};

/// Samples at least this large compute distance updates on the rayon pool.
const PARALLEL_SAMPLE_THRESHOLD: usize = 4096;

/// Anchors chosen from a sample.
#[derive(Debug, Clone)]
pub struct AnchorSelection {
    pub anchors: Vec<Embedding>,
    /// Positions of the anchors in the sample, in selection order.
    pub indices: Vec<usize>,
    pub metric: DistanceMetric,
    pub requested: usize,
    /// Fewer than `requested` distinct points were available.
    pub reduced_fidelity: bool,
}

/// Chooses a small, well-separated set of anchors from a sample.
#[derive(Debug, Clone)]
pub struct AnchorSelector {
    count: usize,
    seed: SeedStrategy,
    metric: DistanceMetric,
}

impl AnchorSelector {
    pub fn new(count: usize, metric: DistanceMetric) -> Self {
        Self {
            count,
            seed: SeedStrategy::default(),
            metric,
        }
    }

    pub fn from_config(config: &AnchorConfig, metric: DistanceMetric) -> Self {
        Self {
            count: config.count,
            seed: config.seed,
            metric,
        }
    }

    pub fn with_seed(mut self, seed: SeedStrategy) -> Self {
        self.seed = seed;
        self
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Select up to `count` anchors by farthest-point traversal.
    ///
    /// Each step adds the point whose distance to its nearest chosen anchor is
    /// largest, ties going to the lowest sample index. Selection stops early
    /// once every remaining point coincides with a chosen anchor.
    pub fn select(&self, sample: &[Embedding]) -> Result<AnchorSelection> {
        if self.count == 0 {
            return Err(AnchorageError::invalid_argument(
                "anchor count must be positive",
            ));
        }
        let Some(first) = sample.first() else {
            return Err(AnchorageError::invalid_argument(
                "cannot select anchors from an empty sample",
            ));
        };
        let dimension = first.dimension();
        for embedding in sample {
            ensure_dimension(dimension, embedding.dimension())?;
        }

        let seed = self.seed_index(sample)?;
        let mut indices = vec![seed];
        let mut nearest = self.distances_to(sample, &sample[seed]);

        while indices.len() < self.count {
            let Some((next, spread)) = farthest(&nearest) else {
                break;
            };
            if spread <= 0.0 {
                break;
            }
            indices.push(next);
            let update = self.distances_to(sample, &sample[next]);
            for (current, candidate) in nearest.iter_mut().zip(update) {
                if candidate < *current {
                    *current = candidate;
                }
            }
        }

        let reduced_fidelity = indices.len() < self.count;
        if reduced_fidelity {
            warn!(
                "only {} distinct anchors available out of {} requested; projection runs at reduced fidelity",
                indices.len(),
                self.count
            );
        }
        debug!(
            "selected {} anchors from a sample of {} ({})",
            indices.len(),
            sample.len(),
            self.metric.name()
        );

        Ok(AnchorSelection {
            anchors: indices.iter().map(|&i| sample[i].clone()).collect(),
            indices,
            metric: self.metric,
            requested: self.count,
            reduced_fidelity,
        })
    }

    fn seed_index(&self, sample: &[Embedding]) -> Result<usize> {
        match self.seed {
            SeedStrategy::First => Ok(0),
            SeedStrategy::Random(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                Ok(rng.random_range(0..sample.len()))
            }
            SeedStrategy::FarthestFromCentroid => {
                let aggregator = CentroidAggregator::new(sample[0].dimension());
                let centroid = aggregator
                    .aggregate(sample.iter().map(Embedding::as_slice))?
                    .value()
                    .ok_or_else(|| AnchorageError::other("centroid of a non-empty sample"))?;
                let distances: Vec<f32> = sample
                    .iter()
                    .map(|e| self.metric.distance_unchecked(e, &centroid.values))
                    .collect();
                Ok(farthest(&distances).map(|(i, _)| i).unwrap_or(0))
            }
        }
    }

    fn distances_to(&self, sample: &[Embedding], anchor: &Embedding) -> Vec<f32> {
        if sample.len() >= PARALLEL_SAMPLE_THRESHOLD {
            sample
                .par_iter()
                .map(|e| self.metric.distance_unchecked(e, anchor))
                .collect()
        } else {
            sample
                .iter()
                .map(|e| self.metric.distance_unchecked(e, anchor))
                .collect()
        }
    }
}

/// Index and value of the largest distance; the first one wins ties.
fn farthest(distances: &[f32]) -> Option<(usize, f32)> {
    distances
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, d)| match best {
            Some((_, best_d)) if d <= best_d => best,
            _ => Some((i, d)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(values: &[[f32; 2]]) -> Vec<Embedding> {
        values
            .iter()
            .map(|p| Embedding::new(p.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_selects_mutually_extreme_points() {
        let sample = points(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [5.0, 6.0]]);
        let selection = AnchorSelector::new(2, DistanceMetric::Euclidean)
            .select(&sample)
            .unwrap();
        let mut indices = selection.indices.clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 4]);
        assert!(!selection.reduced_fidelity);
    }

    #[test]
    fn test_first_seed_strategy() {
        let sample = points(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [5.0, 6.0]]);
        let selection = AnchorSelector::new(2, DistanceMetric::Euclidean)
            .with_seed(SeedStrategy::First)
            .select(&sample)
            .unwrap();
        assert_eq!(selection.indices, vec![0, 4]);
    }

    #[test]
    fn test_random_seed_is_reproducible() {
        let sample: Vec<Embedding> = (0..50)
            .map(|i| Embedding::new(vec![(i as f32).sin(), (i as f32).cos(), i as f32 * 0.01]).unwrap())
            .collect();
        let selector = AnchorSelector::new(4, DistanceMetric::Euclidean)
            .with_seed(SeedStrategy::Random(11));
        let a = selector.select(&sample).unwrap();
        let b = selector.select(&sample).unwrap();
        assert_eq!(a.indices, b.indices);
        assert_eq!(a.indices.len(), 4);
    }

    #[test]
    fn test_ties_break_on_lowest_index() {
        // Both (1, 0) and (0, 1) are at distance 1 from the seed.
        let sample = points(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        let selection = AnchorSelector::new(2, DistanceMetric::Euclidean)
            .with_seed(SeedStrategy::First)
            .select(&sample)
            .unwrap();
        assert_eq!(selection.indices, vec![0, 1]);
    }

    #[test]
    fn test_duplicates_give_reduced_fidelity() {
        let sample = points(&[[1.0, 1.0], [1.0, 1.0], [2.0, 2.0], [2.0, 2.0]]);
        let selection = AnchorSelector::new(3, DistanceMetric::Euclidean)
            .select(&sample)
            .unwrap();
        assert_eq!(selection.anchors.len(), 2);
        assert!(selection.reduced_fidelity);
    }

    #[test]
    fn test_rejects_empty_and_mixed_samples() {
        let selector = AnchorSelector::new(2, DistanceMetric::Euclidean);
        assert!(selector.select(&[]).is_err());

        let mixed = vec![
            Embedding::new(vec![1.0, 2.0]).unwrap(),
            Embedding::new(vec![1.0, 2.0, 3.0]).unwrap(),
        ];
        assert!(matches!(
            selector.select(&mixed),
            Err(AnchorageError::DimensionMismatch { .. })
        ));
    }
}
