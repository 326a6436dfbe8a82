//! Distance -> weight conversion.
//!
//! Both weightings are expressed as logits and normalized with the streaming
//! log-sum-exp, so neither ever exponentiates a raw distance:
//!
//! - `Softmax { temperature }`: logit `-d / T`
//! - `Inverse`: logit `-ln(1 + d)`, i.e. `w = 1 / (1 + d)` after normalization

use crate::aggregate::{EntropyAggregator, EntropyResult, StreamingAggregator, softmax};
use crate::config::Weighting;
use crate::error::{AnchorageError, Result};

/// Logit of one distance under `weighting`.
fn logit(distance: f32, weighting: &Weighting) -> Result<f64> {
    let distance = f64::from(distance);
    if !distance.is_finite() || distance < 0.0 {
        return Err(AnchorageError::invalid_argument(format!(
            "attention distances must be finite and non-negative, got {distance}"
        )));
    }
    let logit = match weighting {
        Weighting::Softmax { temperature } => -distance / temperature,
        Weighting::Inverse => -distance.ln_1p(),
    };
    // A tiny temperature may push the quotient past f64::MAX.
    Ok(logit.max(-f64::MAX))
}

/// Normalized weights for `distances`, in input order.
///
/// The result sums to one within floating point tolerance; an empty input
/// gives an empty vector.
pub fn attention_weights(distances: &[f32], weighting: &Weighting) -> Result<Vec<f64>> {
    weighting.validate()?;
    let logits = distances
        .iter()
        .map(|d| logit(*d, weighting))
        .collect::<Result<Vec<_>>>()?;
    Ok(softmax(&logits)?.value().unwrap_or_default())
}

/// Shannon entropy of an already normalized distribution.
///
/// Zero weights contribute nothing and are skipped. Returns `None` when no
/// weight is positive.
pub fn distribution_entropy(weights: &[f64]) -> Result<Option<EntropyResult>> {
    let logits = weights.iter().filter(|w| **w > 0.0).map(|w| w.ln());
    Ok(EntropyAggregator::default().aggregate(logits)?.value())
}
