//! Several attention heads over the same candidate window.
//!
//! Each head has its own weighting and may re-score candidates under a
//! different metric. Heads are combined either by a weighted vote over their
//! distributions or by letting every head select on its own.

use serde::{Deserialize, Serialize};

use crate::attention::sampler::{
    AttentionOutput, Candidate, Selected, ordered_window, rng_for, select,
};
use crate::attention::weighting::attention_weights;
use crate::config::{Selection, Weighting};
use crate::error::{AnchorageError, Result};
use crate::item::ItemId;
use crate::search::SearchHit;
use crate::vector::{DistanceMetric, Embedding};

/// Settings of one head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionHead {
    pub weighting: Weighting,
    /// Share of this head in a weighted vote.
    pub weight: f64,
    /// Re-score candidates under this metric instead of the search distance.
    pub metric: Option<DistanceMetric>,
}

impl AttentionHead {
    pub fn new(weighting: Weighting) -> Self {
        Self {
            weighting,
            weight: 1.0,
            metric: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = Some(metric);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeadCombination {
    /// Average the head distributions by head weight, then select once.
    #[default]
    WeightedVote,
    /// Every head selects independently.
    Concatenate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadOutput {
    /// Realized distribution of every head, in head order. Under
    /// `Concatenate` each also carries that head's selections.
    pub heads: Vec<AttentionOutput>,
    /// Result of the vote under `WeightedVote`.
    pub vote: Option<AttentionOutput>,
}

impl MultiHeadOutput {
    pub fn selections(&self) -> Vec<Selected> {
        match &self.vote {
            Some(vote) => vote.selections.clone(),
            None => self
                .heads
                .iter()
                .flat_map(|head| head.selections.iter().copied())
                .collect(),
        }
    }

    pub fn selected_ids(&self) -> Vec<ItemId> {
        self.selections().iter().map(|s| s.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MultiHeadResult {
    Selected(MultiHeadOutput),
    NoCandidates,
}

impl MultiHeadResult {
    pub fn output(&self) -> Option<&MultiHeadOutput> {
        match self {
            MultiHeadResult::Selected(output) => Some(output),
            MultiHeadResult::NoCandidates => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiHeadSampler {
    heads: Vec<AttentionHead>,
    combination: HeadCombination,
    selection: Selection,
    draws: usize,
    seed: Option<u64>,
}

impl MultiHeadSampler {
    pub fn new(heads: Vec<AttentionHead>, combination: HeadCombination) -> Result<Self> {
        if heads.is_empty() {
            return Err(AnchorageError::invalid_config(
                "multi-head sampler needs at least one head",
            ));
        }
        for head in &heads {
            head.weighting.validate()?;
            if !(head.weight.is_finite() && head.weight >= 0.0) {
                return Err(AnchorageError::invalid_config(format!(
                    "head weight must be finite and non-negative, got {}",
                    head.weight
                )));
            }
        }
        if combination == HeadCombination::WeightedVote
            && heads.iter().all(|head| head.weight == 0.0)
        {
            return Err(AnchorageError::invalid_config(
                "weighted vote needs at least one head with positive weight",
            ));
        }
        Ok(Self {
            heads,
            combination,
            selection: Selection::Argmax,
            draws: 1,
            seed: None,
        })
    }

    pub fn with_selection(mut self, selection: Selection) -> Result<Self> {
        selection.validate()?;
        self.selection = selection;
        Ok(self)
    }

    pub fn with_draws(mut self, draws: usize) -> Result<Self> {
        if draws == 0 {
            return Err(AnchorageError::invalid_config("draws must be positive"));
        }
        self.draws = draws;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn heads(&self) -> &[AttentionHead] {
        &self.heads
    }

    pub fn combination(&self) -> HeadCombination {
        self.combination
    }

    /// Sample over search hits for `query`.
    ///
    /// Heads with a metric override need every hit to carry its embedding.
    pub fn sample(&self, query: &Embedding, hits: &[SearchHit]) -> Result<MultiHeadResult> {
        if hits.is_empty() {
            return Ok(MultiHeadResult::NoCandidates);
        }
        let mut rng = rng_for(self.seed);

        // Rank order comes from the search distance so every head shares it.
        let mut ordered: Vec<&SearchHit> = hits.iter().collect();
        ordered.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        let base = ordered_window(ordered.iter().map(|hit| Candidate::from(*hit)));

        let mut head_weights = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            let distances = match head.metric {
                None => base.iter().map(|c| c.distance).collect(),
                Some(metric) => rescore(query, &ordered, metric)?,
            };
            head_weights.push(attention_weights(&distances, &head.weighting)?);
        }

        match self.combination {
            HeadCombination::Concatenate => {
                let heads = head_weights
                    .into_iter()
                    .map(|weights| select(&base, weights, self.selection, self.draws, &mut rng))
                    .collect::<Result<Vec<_>>>()?;
                Ok(MultiHeadResult::Selected(MultiHeadOutput { heads, vote: None }))
            }
            HeadCombination::WeightedVote => {
                let total: f64 = self.heads.iter().map(|head| head.weight).sum();
                let mut combined = vec![0.0; base.len()];
                for (head, weights) in self.heads.iter().zip(&head_weights) {
                    for (slot, w) in combined.iter_mut().zip(weights) {
                        *slot += head.weight / total * w;
                    }
                }
                let vote = select(&base, combined, self.selection, self.draws, &mut rng)?;
                let heads = head_weights
                    .into_iter()
                    .map(|weights| select(&base, weights, Selection::Argmax, 1, &mut rng))
                    .map(|output| {
                        output.map(|mut output| {
                            output.selections.clear();
                            output
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(MultiHeadResult::Selected(MultiHeadOutput {
                    heads,
                    vote: Some(vote),
                }))
            }
        }
    }
}

fn rescore(query: &Embedding, hits: &[&SearchHit], metric: DistanceMetric) -> Result<Vec<f32>> {
    hits.iter()
        .map(|hit| {
            let embedding = hit.embedding.as_ref().ok_or_else(|| {
                AnchorageError::invalid_argument(format!(
                    "head metric override needs the embedding of item {}",
                    hit.id
                ))
            })?;
            metric.distance(query, embedding)
        })
        .collect()
}
