//! Weighted selection over a window of candidates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::aggregate::EntropyResult;
use crate::attention::weighting::{attention_weights, distribution_entropy};
use crate::config::{SamplerConfig, Selection};
use crate::error::Result;
use crate::item::ItemId;
use crate::search::{SearchHit, SearchResults};
use crate::spatial::Neighbor;

/// One candidate of the attention window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ItemId,
    pub distance: f32,
}

impl From<&SearchHit> for Candidate {
    fn from(hit: &SearchHit) -> Self {
        Self {
            id: hit.id,
            distance: hit.distance,
        }
    }
}

impl From<Neighbor> for Candidate {
    fn from(neighbor: Neighbor) -> Self {
        Self {
            id: neighbor.id,
            distance: neighbor.distance,
        }
    }
}

impl From<(ItemId, f32)> for Candidate {
    fn from((id, distance): (ItemId, f32)) -> Self {
        Self { id, distance }
    }
}

/// A candidate together with its realized weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedCandidate {
    pub id: ItemId,
    pub distance: f32,
    pub weight: f64,
}

/// One draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Selected {
    pub id: ItemId,
    /// Position in the distance-ordered window.
    pub rank: usize,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionOutput {
    pub selections: Vec<Selected>,
    /// Every candidate with its weight, ordered by `(distance, id)`.
    pub distribution: Vec<WeightedCandidate>,
    /// Number of candidates eligible for a draw: 1 for argmax, the whole
    /// window for weighted draws, the nucleus for nucleus draws.
    pub nucleus_size: usize,
    pub entropy: Option<EntropyResult>,
}

impl AttentionOutput {
    pub fn selected_ids(&self) -> Vec<ItemId> {
        self.selections.iter().map(|s| s.id).collect()
    }

    pub fn weight_of(&self, id: ItemId) -> Option<f64> {
        self.distribution
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.weight)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttentionResult {
    Selected(AttentionOutput),
    NoCandidates,
}

impl AttentionResult {
    pub fn output(&self) -> Option<&AttentionOutput> {
        match self {
            AttentionResult::Selected(output) => Some(output),
            AttentionResult::NoCandidates => None,
        }
    }

    pub fn into_output(self) -> Option<AttentionOutput> {
        match self {
            AttentionResult::Selected(output) => Some(output),
            AttentionResult::NoCandidates => None,
        }
    }

    /// The first selection, if any.
    pub fn first(&self) -> Option<ItemId> {
        self.output()
            .and_then(|output| output.selections.first())
            .map(|s| s.id)
    }
}

/// Converts candidate distances into weights and selects from them.
///
/// Stateless per call; with a configured seed every call with the same
/// window makes the same draws.
#[derive(Debug, Clone)]
pub struct AttentionSampler {
    config: SamplerConfig,
}

impl AttentionSampler {
    pub fn new(config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn sample<C: Into<Candidate> + Copy>(&self, candidates: &[C]) -> Result<AttentionResult> {
        let mut rng = rng_for(self.config.seed);
        let window = ordered_window(candidates.iter().map(|c| (*c).into()));
        if window.is_empty() {
            return Ok(AttentionResult::NoCandidates);
        }
        let distances: Vec<f32> = window.iter().map(|c| c.distance).collect();
        let weights = attention_weights(&distances, &self.config.weighting)?;
        select(
            &window,
            weights,
            self.config.selection,
            self.config.draws,
            &mut rng,
        )
        .map(AttentionResult::Selected)
    }

    pub fn sample_hits(&self, hits: &[SearchHit]) -> Result<AttentionResult> {
        let candidates: Vec<Candidate> = hits.iter().map(Candidate::from).collect();
        self.sample(&candidates)
    }

    pub fn sample_results(&self, results: &SearchResults) -> Result<AttentionResult> {
        self.sample_hits(&results.hits)
    }
}

pub(crate) fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

/// Sort candidates by `(distance, id)`; the position is the rank.
pub(crate) fn ordered_window(candidates: impl Iterator<Item = Candidate>) -> Vec<Candidate> {
    let mut window: Vec<Candidate> = candidates.collect();
    window.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
    window
}

/// Draw from `weights` (aligned with `window`) and package the result.
pub(crate) fn select(
    window: &[Candidate],
    weights: Vec<f64>,
    selection: Selection,
    draws: usize,
    rng: &mut StdRng,
) -> Result<AttentionOutput> {
    let entropy = distribution_entropy(&weights)?;
    let (picks, nucleus_size) = match selection {
        Selection::Argmax => (vec![argmax(&weights); draws], 1),
        Selection::Weighted => {
            let all: Vec<usize> = (0..weights.len()).collect();
            let picks = (0..draws).map(|_| draw(&all, &weights, rng)).collect();
            (picks, weights.len())
        }
        Selection::Nucleus { top_p } => {
            let nucleus = nucleus(&weights, top_p);
            let picks = (0..draws).map(|_| draw(&nucleus, &weights, rng)).collect();
            (picks, nucleus.len())
        }
    };

    let selections = picks
        .into_iter()
        .map(|rank| Selected {
            id: window[rank].id,
            rank,
            weight: weights[rank],
        })
        .collect();
    let distribution = window
        .iter()
        .zip(&weights)
        .map(|(c, w)| WeightedCandidate {
            id: c.id,
            distance: c.distance,
            weight: *w,
        })
        .collect();
    Ok(AttentionOutput {
        selections,
        distribution,
        nucleus_size,
        entropy,
    })
}

/// Highest weight; the lowest rank wins ties.
fn argmax(weights: &[f64]) -> usize {
    let mut best = 0;
    for (i, w) in weights.iter().enumerate().skip(1) {
        if *w > weights[best] {
            best = i;
        }
    }
    best
}

/// Smallest set of ranks, by descending weight, whose cumulative weight
/// reaches `top_p`.
fn nucleus(weights: &[f64], top_p: f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|a, b| weights[*b].total_cmp(&weights[*a]).then(a.cmp(b)));
    let mut cumulative = 0.0;
    let mut size = 0;
    for rank in &order {
        cumulative += weights[*rank];
        size += 1;
        if cumulative >= top_p - 1e-12 {
            break;
        }
    }
    order.truncate(size.max(1));
    order
}

/// Inverse-CDF draw among `eligible` ranks, renormalized over their weights.
fn draw(eligible: &[usize], weights: &[f64], rng: &mut StdRng) -> usize {
    let total: f64 = eligible.iter().map(|rank| weights[*rank]).sum();
    if total <= 0.0 {
        return eligible[0];
    }
    let target = rng.random::<f64>() * total;
    let mut cumulative = 0.0;
    for rank in eligible {
        cumulative += weights[*rank];
        if target < cumulative {
            return *rank;
        }
    }
    // Rounding left the target just past the last bucket.
    eligible
        .iter()
        .rev()
        .find(|rank| weights[**rank] > 0.0)
        .copied()
        .unwrap_or(eligible[0])
}
