//! Context encoders: turn the sliding window into the next query.

use crate::aggregate::{CentroidAggregator, StreamingAggregator};
use crate::error::{AnchorageError, Result};
use crate::vector::Embedding;

/// Encodes a window of embeddings (oldest first) into one query embedding.
pub trait ContextEncoder: Send + Sync + std::fmt::Debug {
    /// `None` for an empty window.
    fn encode(&self, window: &[Embedding]) -> Result<Option<Embedding>>;
}

/// Elementwise mean of the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidContextEncoder;

impl ContextEncoder for CentroidContextEncoder {
    fn encode(&self, window: &[Embedding]) -> Result<Option<Embedding>> {
        let Some(first) = window.first() else {
            return Ok(None);
        };
        let centroid = CentroidAggregator::new(first.dimension())
            .aggregate(window.iter().map(|e| e.as_slice()))?
            .value();
        centroid.map(|c| Embedding::new(c.values)).transpose()
    }
}

/// Weighted mean where the newest item has weight 1 and each older one
/// `decay` times the next.
#[derive(Debug, Clone, Copy)]
pub struct DecayContextEncoder {
    decay: f64,
}

impl DecayContextEncoder {
    pub fn new(decay: f64) -> Result<Self> {
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(AnchorageError::invalid_argument(format!(
                "decay must be in (0, 1], got {decay}"
            )));
        }
        Ok(Self { decay })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }
}

impl ContextEncoder for DecayContextEncoder {
    fn encode(&self, window: &[Embedding]) -> Result<Option<Embedding>> {
        let Some(first) = window.first() else {
            return Ok(None);
        };
        let dimension = first.dimension();
        let mut sum = vec![0.0f64; dimension];
        let mut total = 0.0;
        let mut weight = 1.0;
        for embedding in window.iter().rev() {
            embedding.ensure_dimension(dimension)?;
            for (slot, v) in sum.iter_mut().zip(embedding.iter()) {
                *slot += weight * f64::from(*v);
            }
            total += weight;
            weight *= self.decay;
        }
        let values = sum.into_iter().map(|s| (s / total) as f32).collect();
        Embedding::new(values).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Vec<Embedding> {
        vec![
            Embedding::new(vec![0.0, 0.0]).unwrap(),
            Embedding::new(vec![2.0, 4.0]).unwrap(),
        ]
    }

    #[test]
    fn test_centroid_encoder() {
        let query = CentroidContextEncoder.encode(&window()).unwrap().unwrap();
        assert_eq!(query.as_slice(), &[1.0, 2.0]);
        assert!(CentroidContextEncoder.encode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_decay_encoder_favors_recent_items() {
        let encoder = DecayContextEncoder::new(0.5).unwrap();
        let query = encoder.encode(&window()).unwrap().unwrap();
        // (1 * [2, 4] + 0.5 * [0, 0]) / 1.5
        assert!((query[0] - 4.0 / 3.0).abs() < 1e-6);
        assert!((query[1] - 8.0 / 3.0).abs() < 1e-6);

        let flat = DecayContextEncoder::new(1.0).unwrap();
        assert_eq!(flat.encode(&window()).unwrap().unwrap().as_slice(), &[1.0, 2.0]);
        assert!(DecayContextEncoder::new(0.0).is_err());
        assert!(DecayContextEncoder::new(1.5).is_err());
    }

    #[test]
    fn test_mixed_dimensions_are_rejected() {
        let mut window = window();
        window.push(Embedding::new(vec![1.0, 1.0, 1.0]).unwrap());
        assert!(CentroidContextEncoder.encode(&window).is_err());
        assert!(DecayContextEncoder::new(0.9).unwrap().encode(&window).is_err());
    }
}
