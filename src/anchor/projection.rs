//! Distance-to-anchor projection.

use rayon::prelude::*;

use crate::anchor::set::{AnchorSet, ProjectedCoordinate};
use crate::error::Result;
use crate::vector::Embedding;

/// Batches at least this large are projected on the rayon pool.
const PARALLEL_BATCH_THRESHOLD: usize = 128;

/// Maps embeddings to their distances from each anchor of an [`AnchorSet`].
///
/// The engine holds no state; the anchor set is passed explicitly to every
/// call, and the metric recorded in the set is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionEngine;

impl ProjectionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Project one embedding.
    ///
    /// The zero vector yields a coordinate flagged `degenerate`: directional
    /// metrics report their fixed zero-vector distance for every anchor.
    /// Distances that overflow are clamped to `f32::MAX`.
    pub fn project(&self, embedding: &Embedding, anchors: &AnchorSet) -> Result<ProjectedCoordinate> {
        embedding.ensure_dimension(anchors.dimension())?;
        let metric = anchors.metric();
        let degenerate = embedding.is_zero();

        let values = anchors
            .anchors()
            .iter()
            .map(|anchor| {
                let distance = if degenerate && metric.is_directional() {
                    metric.zero_vector_distance()
                } else {
                    metric.distance_unchecked(embedding, anchor)
                };
                sanitize(distance)
            })
            .collect();

        Ok(ProjectedCoordinate {
            values,
            anchor_version: anchors.version(),
            degenerate,
        })
    }

    /// Project many embeddings, in parallel for large batches.
    pub fn project_batch(
        &self,
        embeddings: &[Embedding],
        anchors: &AnchorSet,
    ) -> Result<Vec<ProjectedCoordinate>> {
        if embeddings.len() < PARALLEL_BATCH_THRESHOLD {
            return embeddings.iter().map(|e| self.project(e, anchors)).collect();
        }
        embeddings
            .par_iter()
            .map(|e| self.project(e, anchors))
            .collect()
    }
}

fn sanitize(distance: f32) -> f32 {
    if distance.is_finite() {
        distance
    } else {
        f32::MAX
    }
}
