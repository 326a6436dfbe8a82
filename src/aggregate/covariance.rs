//! Streaming mean and covariance.
//!
//! Rows are folded with Welford's update and partial states are combined with
//! Chan's pairwise formula, so any partitioning of the input gives the same
//! result up to rounding. The co-moment matrix is `d * d`; for large
//! dimensions prefer the centroid aggregator unless the full matrix is needed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, StreamingAggregator};
use crate::error::{Result, ensure_dimension};
use crate::vector::VectorPool;

#[derive(Debug, Default)]
pub struct CovarianceState {
    count: u64,
    mean: Option<Vec<f64>>,
    comoment: Option<Vec<f64>>,
    scratch: Option<Vec<f64>>,
}

/// Finalized mean and covariance of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceResult {
    pub count: u64,
    pub dimension: usize,
    pub mean: Vec<f64>,
    /// Row-major `sum((x - mean)(x - mean)^T)`.
    pub comoment: Vec<f64>,
}

impl CovarianceResult {
    /// Population covariance entry `(i, j)`.
    pub fn covariance(&self, i: usize, j: usize) -> f64 {
        self.comoment[i * self.dimension + j] / self.count as f64
    }

    /// Row-major population covariance matrix.
    pub fn population_covariance(&self) -> Vec<f64> {
        let n = self.count as f64;
        self.comoment.iter().map(|c| c / n).collect()
    }

    /// Row-major sample covariance matrix; `None` for a single row.
    pub fn sample_covariance(&self) -> Option<Vec<f64>> {
        if self.count < 2 {
            return None;
        }
        let n = (self.count - 1) as f64;
        Some(self.comoment.iter().map(|c| c / n).collect())
    }

    /// Differential entropy (nats) of the Gaussian with this mean and
    /// population covariance; `None` when the covariance is singular.
    pub fn gaussian_entropy(&self) -> Option<f64> {
        let d = self.dimension;
        let log_det = cholesky_log_determinant(&self.population_covariance(), d)?;
        let log_two_pi_e = 1.0 + (2.0 * std::f64::consts::PI).ln();
        Some(0.5 * (d as f64 * log_two_pi_e + log_det))
    }
}

/// Log-determinant of a symmetric positive-definite row-major matrix.
fn cholesky_log_determinant(matrix: &[f64], d: usize) -> Option<f64> {
    let scale = (0..d).map(|i| matrix[i * d + i].abs()).fold(0.0, f64::max);
    let floor = 1e-12 * scale.max(f64::MIN_POSITIVE);
    let mut lower = vec![0.0; d * d];
    let mut log_det = 0.0;
    for i in 0..d {
        for j in 0..=i {
            let mut sum = matrix[i * d + j];
            for k in 0..j {
                sum -= lower[i * d + k] * lower[j * d + k];
            }
            if i == j {
                if sum <= floor {
                    return None;
                }
                let diag = sum.sqrt();
                lower[i * d + i] = diag;
                log_det += 2.0 * diag.ln();
            } else {
                lower[i * d + j] = sum / lower[j * d + j];
            }
        }
    }
    Some(log_det)
}

/// Streaming covariance aggregator for vectors of one dimension.
#[derive(Debug, Clone)]
pub struct CovarianceAggregator {
    vectors: Arc<VectorPool>,
    matrices: Arc<VectorPool>,
}

impl CovarianceAggregator {
    pub fn new(dimension: usize) -> Self {
        Self::with_pool(Arc::new(VectorPool::new(dimension)))
    }

    pub fn with_pool(vectors: Arc<VectorPool>) -> Self {
        let d = vectors.dimension();
        Self {
            vectors,
            matrices: Arc::new(VectorPool::new(d * d)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    fn release_scratch(&self, scratch: Option<Vec<f64>>) -> Result<()> {
        if let Some(buffer) = scratch {
            self.vectors.release(buffer)?;
        }
        Ok(())
    }
}

impl StreamingAggregator for CovarianceAggregator {
    type Input = [f32];
    type State = CovarianceState;
    type Output = CovarianceResult;

    fn init(&self) -> CovarianceState {
        CovarianceState::default()
    }

    fn accumulate(&self, state: &mut CovarianceState, input: &[f32]) -> Result<()> {
        let d = self.dimension();
        ensure_dimension(d, input.len())?;

        let mean = state.mean.get_or_insert_with(|| self.vectors.acquire());
        let comoment = state.comoment.get_or_insert_with(|| self.matrices.acquire());
        let delta = state.scratch.get_or_insert_with(|| self.vectors.acquire());

        state.count += 1;
        let n = state.count as f64;
        for i in 0..d {
            delta[i] = f64::from(input[i]) - mean[i];
        }
        // (x - mean_new) = delta * (n - 1) / n
        let scale = (n - 1.0) / n;
        for i in 0..d {
            let row = delta[i] * scale;
            for j in 0..d {
                comoment[i * d + j] += row * delta[j];
            }
        }
        for i in 0..d {
            mean[i] += delta[i] / n;
        }
        Ok(())
    }

    fn merge(&self, left: CovarianceState, right: CovarianceState) -> Result<CovarianceState> {
        if right.count == 0 {
            self.release_scratch(right.scratch)?;
            return Ok(left);
        }
        if left.count == 0 {
            self.release_scratch(left.scratch)?;
            return Ok(right);
        }

        let d = self.dimension();
        let (Some(mut mean), Some(mut comoment), Some(other_mean), Some(other_comoment)) =
            (left.mean, left.comoment, right.mean, right.comoment)
        else {
            return Ok(CovarianceState::default());
        };
        let mut delta = left.scratch.unwrap_or_else(|| self.vectors.acquire());

        let na = left.count as f64;
        let nb = right.count as f64;
        let n = na + nb;
        for i in 0..d {
            delta[i] = other_mean[i] - mean[i];
        }
        let cross = na * nb / n;
        for i in 0..d {
            for j in 0..d {
                comoment[i * d + j] += other_comoment[i * d + j] + delta[i] * delta[j] * cross;
            }
        }
        for i in 0..d {
            mean[i] += delta[i] * nb / n;
        }

        self.vectors.release(other_mean)?;
        self.matrices.release(other_comoment)?;
        self.release_scratch(right.scratch)?;

        Ok(CovarianceState {
            count: left.count + right.count,
            mean: Some(mean),
            comoment: Some(comoment),
            scratch: Some(delta),
        })
    }

    fn finalize(&self, state: CovarianceState) -> Result<Aggregate<CovarianceResult>> {
        self.release_scratch(state.scratch)?;
        match (state.mean, state.comoment) {
            (Some(mean), Some(comoment)) if state.count > 0 => {
                Ok(Aggregate::Value(CovarianceResult {
                    count: state.count,
                    dimension: self.dimension(),
                    mean,
                    comoment,
                }))
            }
            _ => Ok(Aggregate::NoData),
        }
    }
}
