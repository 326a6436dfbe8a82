//! Anchor sets and the coordinates projected against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::selector::AnchorSelection;
use crate::error::{AnchorageError, Result, ensure_dimension};
use crate::vector::{DistanceMetric, Embedding};

/// An immutable, versioned set of anchor embeddings.
///
/// Coordinates are only comparable when they were projected against the same
/// version. Sets are shared behind an `Arc` and replaced wholesale by a
/// migration, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorSet {
    id: Uuid,
    version: u64,
    metric: DistanceMetric,
    anchors: Vec<Embedding>,
    dimension: usize,
    requested: usize,
    reduced_fidelity: bool,
    created_at: DateTime<Utc>,
}

impl AnchorSet {
    /// Create an unversioned (version 0) set from explicit anchors.
    pub fn new(anchors: Vec<Embedding>, metric: DistanceMetric) -> Result<Self> {
        let requested = anchors.len();
        Self::build(anchors, metric, requested, 0)
    }

    /// Create a set from a selector result.
    pub fn from_selection(selection: AnchorSelection, version: u64) -> Result<Self> {
        Self::build(
            selection.anchors,
            selection.metric,
            selection.requested,
            version,
        )
    }

    fn build(
        anchors: Vec<Embedding>,
        metric: DistanceMetric,
        requested: usize,
        version: u64,
    ) -> Result<Self> {
        let Some(first) = anchors.first() else {
            return Err(AnchorageError::invalid_argument(
                "an anchor set needs at least one anchor",
            ));
        };
        let dimension = first.dimension();
        for anchor in &anchors {
            ensure_dimension(dimension, anchor.dimension())?;
        }
        Ok(Self {
            id: Uuid::new_v4(),
            version,
            metric,
            reduced_fidelity: anchors.len() < requested,
            anchors,
            dimension,
            requested,
            created_at: Utc::now(),
        })
    }

    /// Copy of this set carrying another version number.
    pub(crate) fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn anchors(&self) -> &[Embedding] {
        &self.anchors
    }

    /// Number of anchors, i.e. the arity of projected coordinates.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Embedding dimension the set projects from.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of anchors that were asked for.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Set when fewer distinct anchors than requested could be found.
    pub fn reduced_fidelity(&self) -> bool {
        self.reduced_fidelity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Distances from one embedding to each anchor of a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedCoordinate {
    pub values: Vec<f32>,
    /// Version of the anchor set the coordinate was computed against.
    pub anchor_version: u64,
    /// The input was the zero vector and `values` is a sentinel.
    pub degenerate: bool,
}

impl ProjectedCoordinate {
    pub fn new(values: Vec<f32>, anchor_version: u64) -> Self {
        Self {
            values,
            anchor_version,
            degenerate: false,
        }
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}
