//! Geometric median via bounded Weiszfeld iteration.
//!
//! Unlike the other aggregators this one is not single-pass: the state keeps
//! every accumulated row (flattened) and `finalize` iterates over them. Merge
//! concatenates rows, so it is associative; the iteration itself is a bounded
//! approximation controlled by [`MedianConfig`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, StreamingAggregator};
use crate::config::MedianConfig;
use crate::error::{Result, ensure_dimension};
use crate::vector::VectorPool;

/// Points closer than this to the current estimate count as coincident.
const COINCIDENT_EPSILON: f64 = 1e-12;

#[derive(Debug, Default)]
pub struct MedianState {
    points: Vec<f32>,
    count: usize,
}

impl MedianState {
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Finalized geometric median of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometricMedian {
    pub point: Vec<f32>,
    pub iterations: usize,
    /// Whether the last step moved less than the configured tolerance.
    pub converged: bool,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct GeometricMedianAggregator {
    pool: Arc<VectorPool>,
    config: MedianConfig,
}

impl GeometricMedianAggregator {
    pub fn new(dimension: usize, config: MedianConfig) -> Self {
        Self::with_pool(Arc::new(VectorPool::new(dimension)), config)
    }

    pub fn with_pool(pool: Arc<VectorPool>, config: MedianConfig) -> Self {
        Self { pool, config }
    }

    pub fn dimension(&self) -> usize {
        self.pool.dimension()
    }

    /// One Weiszfeld step with the Vardi-Zhang correction for an estimate
    /// that coincides with input points. Returns `true` when the estimate is
    /// already optimal.
    fn step(&self, points: &[f32], estimate: &mut [f64], numerator: &mut [f64]) -> bool {
        let d = estimate.len();
        numerator.iter_mut().for_each(|v| *v = 0.0);
        let mut denominator = 0.0;
        let mut coincident = 0usize;

        for point in points.chunks_exact(d) {
            let distance = point
                .iter()
                .zip(estimate.iter())
                .map(|(p, e)| {
                    let diff = f64::from(*p) - e;
                    diff * diff
                })
                .sum::<f64>()
                .sqrt();
            if distance < COINCIDENT_EPSILON {
                coincident += 1;
                continue;
            }
            let weight = 1.0 / distance;
            for (acc, p) in numerator.iter_mut().zip(point) {
                *acc += weight * f64::from(*p);
            }
            denominator += weight;
        }

        if denominator == 0.0 {
            return true;
        }

        // R = sum(w_i * (p_i - estimate)) = numerator - denominator * estimate
        let residual = numerator
            .iter()
            .zip(estimate.iter())
            .map(|(n, e)| {
                let r = n - denominator * e;
                r * r
            })
            .sum::<f64>()
            .sqrt();
        if coincident > 0 && residual <= coincident as f64 {
            return true;
        }

        let pull = if coincident > 0 {
            (coincident as f64 / residual).min(1.0)
        } else {
            0.0
        };
        for (e, n) in estimate.iter_mut().zip(numerator.iter()) {
            let target = n / denominator;
            *e = (1.0 - pull) * target + pull * *e;
        }
        false
    }
}

impl StreamingAggregator for GeometricMedianAggregator {
    type Input = [f32];
    type State = MedianState;
    type Output = GeometricMedian;

    fn init(&self) -> MedianState {
        MedianState::default()
    }

    fn accumulate(&self, state: &mut MedianState, input: &[f32]) -> Result<()> {
        ensure_dimension(self.dimension(), input.len())?;
        state.points.extend_from_slice(input);
        state.count += 1;
        Ok(())
    }

    fn merge(&self, mut left: MedianState, right: MedianState) -> Result<MedianState> {
        left.points.extend_from_slice(&right.points);
        left.count += right.count;
        Ok(left)
    }

    fn finalize(&self, state: MedianState) -> Result<Aggregate<GeometricMedian>> {
        if state.count == 0 {
            return Ok(Aggregate::NoData);
        }
        let d = self.dimension();

        // Start from the centroid.
        let mut estimate = self.pool.acquire();
        for point in state.points.chunks_exact(d) {
            for (e, p) in estimate.iter_mut().zip(point) {
                *e += f64::from(*p);
            }
        }
        let n = state.count as f64;
        estimate.iter_mut().for_each(|e| *e /= n);

        let mut numerator = self.pool.acquire();
        let mut previous = self.pool.acquire();
        let mut iterations = 0;
        let mut converged = state.count == 1;

        while !converged && iterations < self.config.max_iterations {
            iterations += 1;
            previous.copy_from_slice(&estimate);
            if self.step(&state.points, &mut estimate, &mut numerator) {
                converged = true;
                break;
            }
            let shift = estimate
                .iter()
                .zip(previous.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            if shift < self.config.tolerance {
                converged = true;
            }
        }

        let point = estimate.iter().map(|v| *v as f32).collect();
        self.pool.release(estimate)?;
        self.pool.release(numerator)?;
        self.pool.release(previous)?;

        Ok(Aggregate::Value(GeometricMedian {
            point,
            iterations,
            converged,
            count: state.count,
        }))
    }
}
