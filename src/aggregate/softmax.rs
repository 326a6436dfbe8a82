//! Streaming log-sum-exp and softmax.
//!
//! The state keeps the running maximum `M` and `S = sum(exp(x_i - M))`.
//! Whenever a new value exceeds `M`, `S` is rescaled by `exp(M_old - M_new)`
//! before the new term is added, so no exponent is ever taken of a positive
//! number and the sum cannot overflow.

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, StreamingAggregator};
use crate::error::{AnchorageError, Result};

/// Running maximum and max-scaled sum of exponentials.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSumExpState {
    max: f64,
    scaled_sum: f64,
    count: u64,
}

impl Default for LogSumExpState {
    fn default() -> Self {
        Self {
            max: f64::NEG_INFINITY,
            scaled_sum: 0.0,
            count: 0,
        }
    }
}

impl LogSumExpState {
    /// Fold one finite value into the state.
    pub fn push(&mut self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(AnchorageError::invalid_argument(format!(
                "log-sum-exp input must be finite, got {value}"
            )));
        }
        if value > self.max {
            // exp(-inf) == 0, so the first value needs no special case.
            self.scaled_sum = self.scaled_sum * (self.max - value).exp() + 1.0;
            self.max = value;
        } else {
            self.scaled_sum += (value - self.max).exp();
        }
        self.count += 1;
        Ok(())
    }

    /// Combine two states by rescaling both sums to the larger maximum.
    pub fn combine(self, other: Self) -> Self {
        if other.count == 0 {
            return self;
        }
        if self.count == 0 {
            return other;
        }
        let max = self.max.max(other.max);
        Self {
            max,
            scaled_sum: self.scaled_sum * (self.max - max).exp()
                + other.scaled_sum * (other.max - max).exp(),
            count: self.count + other.count,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `log(sum(exp(x_i)))`, or `None` for an empty state.
    pub fn log_sum_exp(&self) -> Option<f64> {
        (self.count > 0).then(|| self.max + self.scaled_sum.ln())
    }
}

/// Finalized log-sum-exp of a group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogSumExp {
    /// Largest value seen.
    pub max: f64,
    /// `sum(exp(x_i - max))`.
    pub scaled_sum: f64,
    pub count: u64,
    /// `log(sum(exp(x_i)))`.
    pub value: f64,
}

impl LogSumExp {
    /// Softmax probability of one of the accumulated values.
    ///
    /// Works from `max` and `scaled_sum` directly: for large logits
    /// `max + ln(scaled_sum)` rounds the sum away.
    pub fn probability(&self, x: f64) -> f64 {
        (x - self.max).exp() / self.scaled_sum
    }

    pub fn log_probability(&self, x: f64) -> f64 {
        (x - self.max) - self.scaled_sum.ln()
    }
}

/// Streaming log-sum-exp over scalar values.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSumExpAggregator;

impl StreamingAggregator for LogSumExpAggregator {
    type Input = f64;
    type State = LogSumExpState;
    type Output = LogSumExp;

    fn init(&self) -> LogSumExpState {
        LogSumExpState::default()
    }

    fn accumulate(&self, state: &mut LogSumExpState, input: &f64) -> Result<()> {
        state.push(*input)
    }

    fn merge(&self, left: LogSumExpState, right: LogSumExpState) -> Result<LogSumExpState> {
        Ok(left.combine(right))
    }

    fn finalize(&self, state: LogSumExpState) -> Result<Aggregate<LogSumExp>> {
        Ok(match state.log_sum_exp() {
            Some(value) => Aggregate::Value(LogSumExp {
                max: state.max,
                scaled_sum: state.scaled_sum,
                count: state.count,
                value,
            }),
            None => Aggregate::NoData,
        })
    }
}

/// Numerically stable softmax of `logits`.
///
/// Returns `NoData` for an empty slice.
pub fn softmax(logits: &[f64]) -> Result<Aggregate<Vec<f64>>> {
    let lse = LogSumExpAggregator.aggregate(logits.iter().copied())?;
    Ok(lse.map(|lse| logits.iter().map(|x| lse.probability(*x)).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_lse(values: &[f64]) -> f64 {
        values.iter().map(|v| v.exp()).sum::<f64>().ln()
    }

    #[test]
    fn test_matches_naive_for_small_values() {
        let values = [0.5, -1.0, 2.0, 0.0, 1.25];
        let lse = LogSumExpAggregator
            .aggregate(values.iter().copied())
            .unwrap()
            .value()
            .unwrap();
        assert!((lse.value - naive_lse(&values)).abs() < 1e-12);
        assert_eq!(lse.count, 5);
        assert_eq!(lse.max, 2.0);
    }

    #[test]
    fn test_rescales_on_new_maximum() {
        let mut state = LogSumExpState::default();
        state.push(1.0).unwrap();
        state.push(1000.0).unwrap();
        state.push(-1000.0).unwrap();
        let value = state.log_sum_exp().unwrap();
        assert!((value - 1000.0).abs() < 1e-9);
        assert!(value.is_finite());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let values: Vec<f64> = (0..50).map(|i| (i as f64 * 37.0) % 113.0 - 40.0).collect();
        let agg = LogSumExpAggregator;

        let mut whole = agg.init();
        for v in &values {
            agg.accumulate(&mut whole, v).unwrap();
        }

        let (a, b) = values.split_at(17);
        let mut left = agg.init();
        a.iter().for_each(|v| left.push(*v).unwrap());
        let mut right = agg.init();
        b.iter().for_each(|v| right.push(*v).unwrap());

        let ab = agg.merge(left, right).unwrap().log_sum_exp().unwrap();
        let ba = agg.merge(right, left).unwrap().log_sum_exp().unwrap();
        let expected = whole.log_sum_exp().unwrap();
        assert!((ab - expected).abs() < 1e-9);
        assert!((ba - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut state = LogSumExpState::default();
        assert!(state.push(f64::NAN).is_err());
        assert!(state.push(f64::INFINITY).is_err());
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn test_softmax_sums_to_one_for_extreme_inputs() {
        let logits = [0.0, -1e6, -5e5, -1.0];
        let probs = softmax(&logits).unwrap().value().unwrap();
        let total: f64 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(probs.iter().all(|p| p.is_finite()));

        assert!(softmax(&[]).unwrap().is_no_data());
    }

    #[test]
    fn test_softmax_of_huge_equal_logits_is_uniform() {
        for logit in [-1e17, -1e16, -1e12, 1e15] {
            let probs = softmax(&[logit; 4]).unwrap().value().unwrap();
            for p in &probs {
                assert!((p - 0.25).abs() < 1e-12, "{logit}: {probs:?}");
            }
            let lse = LogSumExpAggregator
                .aggregate([logit; 4])
                .unwrap()
                .value()
                .unwrap();
            assert!((lse.log_probability(logit) - 0.25f64.ln()).abs() < 1e-12);
        }
    }
}
