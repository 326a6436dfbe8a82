//! Streaming Shannon entropy of a softmax distribution.
//!
//! For logits `x_i` with `p_i = exp(x_i) / Z`, the entropy is
//! `H = ln Z - sum(p_i * x_i)`. The state tracks the running maximum `M`,
//! `S = sum(exp(x_i - M))` and the centered moment
//! `W = sum((x_i - M) * exp(x_i - M))`, which gives `H = ln S - W / S`
//! without cancellation between two large numbers. When `M` moves to `M'`,
//! `W` becomes `exp(M - M') * (W + (M - M') * S)`.

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, StreamingAggregator};
use crate::error::{AnchorageError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyState {
    max: f64,
    scaled_sum: f64,
    centered_moment: f64,
    count: u64,
}

impl Default for EntropyState {
    fn default() -> Self {
        Self {
            max: f64::NEG_INFINITY,
            scaled_sum: 0.0,
            centered_moment: 0.0,
            count: 0,
        }
    }
}

impl EntropyState {
    /// Move the reference maximum to `new_max >= self.max`.
    fn rebase(&mut self, new_max: f64) {
        if self.count == 0 {
            self.max = new_max;
            return;
        }
        let shift = self.max - new_max;
        let factor = shift.exp();
        self.centered_moment = factor * (self.centered_moment + shift * self.scaled_sum);
        self.scaled_sum *= factor;
        self.max = new_max;
    }

    fn push(&mut self, logit: f64) {
        if logit > self.max {
            self.rebase(logit);
        }
        let offset = logit - self.max;
        let weight = offset.exp();
        self.scaled_sum += weight;
        self.centered_moment += offset * weight;
        self.count += 1;
    }

    fn combine(mut self, mut other: Self) -> Self {
        if other.count == 0 {
            return self;
        }
        if self.count == 0 {
            return other;
        }
        let max = self.max.max(other.max);
        self.rebase(max);
        other.rebase(max);
        Self {
            max,
            scaled_sum: self.scaled_sum + other.scaled_sum,
            centered_moment: self.centered_moment + other.centered_moment,
            count: self.count + other.count,
        }
    }
}

/// Entropy of the softmax over a group of logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntropyResult {
    pub nats: f64,
    pub bits: f64,
    /// Entropy divided by `ln(count)`; `None` for a single value.
    pub normalized: Option<f64>,
    pub count: u64,
}

/// Streaming entropy aggregator. Inputs are divided by `temperature` before
/// being treated as logits.
#[derive(Debug, Clone, Copy)]
pub struct EntropyAggregator {
    temperature: f64,
}

impl Default for EntropyAggregator {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

impl EntropyAggregator {
    pub fn with_temperature(temperature: f64) -> Result<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(AnchorageError::invalid_argument(format!(
                "temperature must be finite and positive, got {temperature}"
            )));
        }
        Ok(Self { temperature })
    }
}

impl StreamingAggregator for EntropyAggregator {
    type Input = f64;
    type State = EntropyState;
    type Output = EntropyResult;

    fn init(&self) -> EntropyState {
        EntropyState::default()
    }

    fn accumulate(&self, state: &mut EntropyState, input: &f64) -> Result<()> {
        let logit = input / self.temperature;
        if !logit.is_finite() {
            return Err(AnchorageError::invalid_argument(format!(
                "entropy input must be finite, got {input}"
            )));
        }
        state.push(logit);
        Ok(())
    }

    fn merge(&self, left: EntropyState, right: EntropyState) -> Result<EntropyState> {
        Ok(left.combine(right))
    }

    fn finalize(&self, state: EntropyState) -> Result<Aggregate<EntropyResult>> {
        if state.count == 0 {
            return Ok(Aggregate::NoData);
        }
        let nats = (state.scaled_sum.ln() - state.centered_moment / state.scaled_sum).max(0.0);
        let normalized = (state.count > 1).then(|| nats / (state.count as f64).ln());
        Ok(Aggregate::Value(EntropyResult {
            nats,
            bits: nats / std::f64::consts::LN_2,
            normalized,
            count: state.count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_entropy(logits: &[f64]) -> f64 {
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let z: f64 = logits.iter().map(|x| (x - max).exp()).sum();
        logits
            .iter()
            .map(|x| {
                let p = (x - max).exp() / z;
                if p > 0.0 { -p * p.ln() } else { 0.0 }
            })
            .sum()
    }

    #[test]
    fn test_uniform_distribution_has_max_entropy() {
        let agg = EntropyAggregator::default();
        let result = agg.aggregate([3.0f64; 8]).unwrap().value().unwrap();
        assert!((result.nats - 8f64.ln()).abs() < 1e-12);
        assert!((result.bits - 3.0).abs() < 1e-12);
        assert!((result.normalized.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_matches_reference() {
        let logits = [0.1, -2.0, 3.5, 0.0, 1.0, -0.7];
        let result = EntropyAggregator::default()
            .aggregate(logits)
            .unwrap()
            .value()
            .unwrap();
        assert!((result.nats - reference_entropy(&logits)).abs() < 1e-10);
    }

    #[test]
    fn test_peaked_distribution_with_huge_spread() {
        let logits = [0.0, -1e6, -2e6];
        let result = EntropyAggregator::default()
            .aggregate(logits)
            .unwrap()
            .value()
            .unwrap();
        assert!(result.nats.abs() < 1e-9);
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let logits: Vec<f64> = (0..40).map(|i| ((i * 7) % 19) as f64 - 9.0).collect();
        let agg = EntropyAggregator::with_temperature(0.5).unwrap();

        let whole = agg.aggregate(logits.iter().copied()).unwrap().value().unwrap();

        let mut parts = Vec::new();
        for chunk in logits.chunks(13) {
            let mut state = agg.init();
            for v in chunk {
                agg.accumulate(&mut state, v).unwrap();
            }
            parts.push(state);
        }
        let mut merged = agg.init();
        for part in parts.into_iter().rev() {
            merged = agg.merge(part, merged).unwrap();
        }
        let merged = agg.finalize(merged).unwrap().value().unwrap();
        assert!((merged.nats - whole.nats).abs() < 1e-10);
    }

    #[test]
    fn test_invalid_temperature() {
        assert!(EntropyAggregator::with_temperature(0.0).is_err());
        assert!(EntropyAggregator::with_temperature(f64::NAN).is_err());
    }
}
