//! Attention-style selection over search candidates.
//!
//! Distances from the exact stage of a search are turned into a probability
//! distribution and one or more candidates are drawn from it. This replaces
//! matrix-multiplication attention with retrieval: the "keys" are whatever
//! the funnel returned.
//!
//! # Module Structure
//!
//! - `weighting`: softmax and inverse-distance weights, distribution entropy
//! - `sampler`: single-head argmax, weighted and nucleus selection
//! - `multihead`: several heads combined by vote or concatenation

pub mod multihead;
pub mod sampler;
pub mod weighting;

pub use self::multihead::{
    AttentionHead, HeadCombination, MultiHeadOutput, MultiHeadResult, MultiHeadSampler,
};
pub use self::sampler::{
    AttentionOutput, AttentionResult, AttentionSampler, Candidate, Selected, WeightedCandidate,
};
pub use self::weighting::{attention_weights, distribution_entropy};
