//! Immutable embedding values.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AnchorageError, Result, ensure_dimension};
use crate::vector::simd::magnitude_simd;

/// A fixed-length, finite, immutable embedding.
///
/// Cloning is cheap: the values live behind an `Arc<[f32]>` and are shared.
/// Two embeddings are only ever compared when their dimensions match; nothing
/// in this crate pads or truncates.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Arc<[f32]>,
}

impl Embedding {
    /// Create a new embedding, rejecting empty or non-finite input.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(AnchorageError::invalid_argument("embedding is empty"));
        }
        if let Some(position) = values.iter().position(|v| !v.is_finite()) {
            return Err(AnchorageError::invalid_argument(format!(
                "embedding contains a non-finite value at position {position}"
            )));
        }
        Ok(Self {
            values: values.into(),
        })
    }

    /// Create an embedding and check it against an expected dimension.
    pub fn with_dimension(values: Vec<f32>, dimension: usize) -> Result<Self> {
        ensure_dimension(dimension, values.len())?;
        Self::new(values)
    }

    /// Get the dimensionality of this embedding.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Calculate the L2 norm (magnitude) of this embedding.
    pub fn norm(&self) -> f32 {
        magnitude_simd(&self.values)
    }

    /// Whether every component is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Fail unless this embedding has the given dimension.
    pub fn ensure_dimension(&self, expected: usize) -> Result<()> {
        ensure_dimension(expected, self.dimension())
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = AnchorageError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Embedding::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values.to_vec()
    }
}

impl Deref for Embedding {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.values
    }
}

impl AsRef<[f32]> for Embedding {
    fn as_ref(&self) -> &[f32] {
        &self.values
    }
}

impl Borrow<[f32]> for Embedding {
    fn borrow(&self) -> &[f32] {
        &self.values
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 4;
        let shown = &self.values[..self.values.len().min(PREVIEW)];
        f.debug_struct("Embedding")
            .field("dimension", &self.values.len())
            .field("head", &shown)
            .finish()
    }
}
