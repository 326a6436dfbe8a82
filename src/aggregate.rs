//! Single-pass, mergeable statistics over groups of embeddings or scores.
//!
//! Every aggregator follows the same four-step contract:
//!
//! 1. [`StreamingAggregator::init`] creates an empty state for a group,
//! 2. [`StreamingAggregator::accumulate`] folds one input into it,
//! 3. [`StreamingAggregator::merge`] combines two partial states (associative
//!    and commutative, so partitions can be reduced in any order),
//! 4. [`StreamingAggregator::finalize`] turns the state into a result, or
//!    [`Aggregate::NoData`] when the group saw no input.
//!
//! # Module Structure
//!
//! - `centroid`: elementwise mean
//! - `softmax`: streaming log-sum-exp with max rescaling
//! - `entropy`: Shannon entropy of the softmax over streamed logits
//! - `covariance`: running mean and co-moment matrix
//! - `median`: geometric median (bounded Weiszfeld iteration, not single-pass)
//! - `grouped`: keyed partial aggregation and parallel reduction

pub mod centroid;
pub mod covariance;
pub mod entropy;
pub mod grouped;
pub mod median;
pub mod softmax;

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::centroid::{Centroid, CentroidAggregator};
pub use self::covariance::{CovarianceAggregator, CovarianceResult};
pub use self::entropy::{EntropyAggregator, EntropyResult};
pub use self::grouped::{PartialAggregation, aggregate_by_key};
pub use self::median::{GeometricMedian, GeometricMedianAggregator};
pub use self::softmax::{LogSumExp, LogSumExpAggregator, LogSumExpState, softmax};

/// Finalized result of an aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregate<T> {
    /// The group received at least one input.
    Value(T),
    /// The group was empty; nothing was divided by zero.
    NoData,
}

impl<T> Aggregate<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Aggregate::Value(value) => Some(value),
            Aggregate::NoData => None,
        }
    }

    pub fn as_ref(&self) -> Aggregate<&T> {
        match self {
            Aggregate::Value(value) => Aggregate::Value(value),
            Aggregate::NoData => Aggregate::NoData,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Aggregate::NoData)
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Aggregate<U> {
        match self {
            Aggregate::Value(value) => Aggregate::Value(f(value)),
            Aggregate::NoData => Aggregate::NoData,
        }
    }
}

/// Init / Accumulate / Merge / Finalize contract shared by all aggregators.
pub trait StreamingAggregator: Send + Sync {
    /// One row of input (`[f32]` for vectors, `f64` for scalar scores).
    type Input: ?Sized;
    /// Partial state for one group.
    type State: Send;
    /// Finalized statistic.
    type Output;

    /// Create the empty state of a group.
    fn init(&self) -> Self::State;

    /// Fold one input into the state.
    fn accumulate(&self, state: &mut Self::State, input: &Self::Input) -> Result<()>;

    /// Combine two partial states.
    fn merge(&self, left: Self::State, right: Self::State) -> Result<Self::State>;

    /// Produce the result of a group.
    fn finalize(&self, state: Self::State) -> Result<Aggregate<Self::Output>>;

    /// Single-pass aggregation of one sequence of inputs.
    fn aggregate<I, V>(&self, inputs: I) -> Result<Aggregate<Self::Output>>
    where
        I: IntoIterator<Item = V>,
        V: Borrow<Self::Input>,
    {
        let mut state = self.init();
        for input in inputs {
            self.accumulate(&mut state, input.borrow())?;
        }
        self.finalize(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_helpers() {
        let value: Aggregate<u32> = Aggregate::Value(3);
        assert_eq!(value.as_ref().map(|v| v * 2), Aggregate::Value(6));
        assert_eq!(value.value(), Some(3));

        let empty: Aggregate<u32> = Aggregate::NoData;
        assert!(empty.is_no_data());
        assert_eq!(empty.value(), None);
    }
}
