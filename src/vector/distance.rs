//! Distance metrics for projection and exact rerank.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{AnchorageError, Result, ensure_dimension};
use crate::vector::simd::{dot_product_simd, magnitude_simd, squared_euclidean_simd};

/// Batches at least this large are scored on the rayon pool.
const PARALLEL_BATCH_THRESHOLD: usize = 256;

/// Distance metrics for vector comparison.
///
/// All variants are true distances (non-negative, zero for identical
/// direction or position), which the projection relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Euclidean (L2) distance
    #[default]
    Euclidean,
    /// Cosine distance (1 - cosine similarity)
    Cosine,
    /// Angular distance (arc cosine of cosine similarity)
    Angular,
    /// Manhattan (L1) distance
    Manhattan,
}

impl DistanceMetric {
    /// Calculate the distance between two vectors using this metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        ensure_dimension(a.len(), b.len())?;
        Ok(self.distance_unchecked(a, b))
    }

    /// Distance without the dimension check. Callers must have validated it.
    pub(crate) fn distance_unchecked(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Euclidean => squared_euclidean_simd(a, b).sqrt(),
            DistanceMetric::Cosine => match cosine_similarity(a, b) {
                Some(cosine) => (1.0 - cosine).max(0.0),
                None => self.zero_vector_distance(),
            },
            DistanceMetric::Angular => match cosine_similarity(a, b) {
                Some(cosine) => cosine.clamp(-1.0, 1.0).acos(),
                None => self.zero_vector_distance(),
            },
            DistanceMetric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        }
    }

    /// Distance reported when either side of a direction-based metric is the zero vector.
    ///
    /// Zero vectors have no direction, so they are placed at the "orthogonal"
    /// distance from everything.
    pub fn zero_vector_distance(&self) -> f32 {
        match self {
            DistanceMetric::Euclidean | DistanceMetric::Manhattan => 0.0,
            DistanceMetric::Cosine => 1.0,
            DistanceMetric::Angular => std::f32::consts::FRAC_PI_2,
        }
    }

    /// Whether this metric is undefined for zero vectors.
    pub fn is_directional(&self) -> bool {
        matches!(self, DistanceMetric::Cosine | DistanceMetric::Angular)
    }

    /// Get the name of this distance metric.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Angular => "angular",
            DistanceMetric::Manhattan => "manhattan",
        }
    }

    /// Parse a distance metric from a string.
    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            "angular" => Ok(DistanceMetric::Angular),
            "manhattan" | "l1" => Ok(DistanceMetric::Manhattan),
            _ => Err(AnchorageError::invalid_argument(format!(
                "Unknown distance metric: {s}"
            ))),
        }
    }

    /// Calculate distance between a query vector and multiple vectors, in
    /// parallel for large batches.
    pub fn batch_distance_parallel(&self, query: &[f32], vectors: &[&[f32]]) -> Result<Vec<f32>> {
        if vectors.len() < PARALLEL_BATCH_THRESHOLD {
            return vectors.iter().map(|v| self.distance(query, v)).collect();
        }

        vectors
            .par_iter()
            .map(|v| self.distance(query, v))
            .collect::<Result<Vec<_>>>()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    let norm_a = magnitude_simd(a);
    let norm_b = magnitude_simd(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot_product_simd(a, b) / (norm_a * norm_b))
}
