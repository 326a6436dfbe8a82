//! Streaming centroid (elementwise mean).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, StreamingAggregator};
use crate::error::{Result, ensure_dimension};
use crate::vector::VectorPool;

/// Finalized centroid of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub values: Vec<f32>,
    pub count: u64,
}

/// Running f64 sum and count for one group.
#[derive(Debug, Default)]
pub struct CentroidState {
    sum: Option<Vec<f64>>,
    count: u64,
}

impl CentroidState {
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Centroid aggregator over vectors of one dimension.
#[derive(Debug, Clone)]
pub struct CentroidAggregator {
    pool: Arc<VectorPool>,
}

impl CentroidAggregator {
    pub fn new(dimension: usize) -> Self {
        Self::with_pool(Arc::new(VectorPool::new(dimension)))
    }

    /// Share a buffer pool with other aggregators of the same dimension.
    pub fn with_pool(pool: Arc<VectorPool>) -> Self {
        Self { pool }
    }

    pub fn dimension(&self) -> usize {
        self.pool.dimension()
    }
}

impl StreamingAggregator for CentroidAggregator {
    type Input = [f32];
    type State = CentroidState;
    type Output = Centroid;

    fn init(&self) -> CentroidState {
        CentroidState::default()
    }

    fn accumulate(&self, state: &mut CentroidState, input: &[f32]) -> Result<()> {
        ensure_dimension(self.pool.dimension(), input.len())?;
        let sum = state.sum.get_or_insert_with(|| self.pool.acquire());
        for (acc, value) in sum.iter_mut().zip(input) {
            *acc += f64::from(*value);
        }
        state.count += 1;
        Ok(())
    }

    fn merge(&self, left: CentroidState, right: CentroidState) -> Result<CentroidState> {
        let sum = match (left.sum, right.sum) {
            (Some(mut into), Some(from)) => {
                for (acc, value) in into.iter_mut().zip(&from) {
                    *acc += value;
                }
                self.pool.release(from)?;
                Some(into)
            }
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        };
        Ok(CentroidState {
            sum,
            count: left.count + right.count,
        })
    }

    fn finalize(&self, state: CentroidState) -> Result<Aggregate<Centroid>> {
        let Some(sum) = state.sum else {
            return Ok(Aggregate::NoData);
        };
        if state.count == 0 {
            self.pool.release(sum)?;
            return Ok(Aggregate::NoData);
        }

        let count = state.count as f64;
        let values = sum.iter().map(|s| (s / count) as f32).collect();
        self.pool.release(sum)?;
        Ok(Aggregate::Value(Centroid {
            values,
            count: state.count,
        }))
    }
}
