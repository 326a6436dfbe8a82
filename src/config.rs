//! Engine configuration.
//!
//! Every section has sensible defaults, so a JSON document only needs to name
//! the values it overrides:
//!
//! ```
//! use anchorage::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "funnel": { "coarse_cap": 500 } }"#).unwrap();
//! assert_eq!(config.funnel.coarse_cap, 500);
//! assert_eq!(config.funnel.fine_cap, 100);
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnchorageError, Result};
use crate::vector::DistanceMetric;

/// How the first anchor is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    /// The first point of the sample.
    First,
    /// A uniformly random point drawn with the given seed.
    Random(u64),
    /// The point farthest from the sample centroid.
    #[default]
    FarthestFromCentroid,
}

/// Anchor selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Number of anchors (projected dimensionality).
    pub count: usize,
    pub seed: SeedStrategy,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            count: 3,
            seed: SeedStrategy::default(),
        }
    }
}

/// Spatial tier and exact store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Target points per leaf of the coarse tree.
    pub coarse_leaf_size: usize,
    /// Target points per leaf of the fine tree.
    pub fine_leaf_size: usize,
    /// Rebuild once appended points exceed this fraction of the built size.
    pub rebuild_ratio: f64,
    /// Compact once tombstoned points exceed this fraction of all points.
    pub compaction_ratio: f64,
    /// Largest embedding dimension the exact store accepts.
    pub max_exact_dimension: usize,
    /// Hand rebuilds to an attached maintenance worker instead of running
    /// them inline on commit.
    pub background_maintenance: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            coarse_leaf_size: 256,
            fine_leaf_size: 16,
            rebuild_ratio: 0.5,
            compaction_ratio: 0.3,
            max_exact_dimension: 2000,
            background_maintenance: false,
        }
    }
}

/// Candidate caps and fallbacks of the coarse -> fine -> exact funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelConfig {
    /// C1: candidates kept after the coarse stage.
    pub coarse_cap: usize,
    /// C2: candidates kept after the fine stage.
    pub fine_cap: usize,
    /// Multiplier applied to the coarse cell budget on each retry.
    pub expansion_factor: f64,
    pub max_expansions: usize,
    /// Corpora at most this large fall back to a full exact scan when the
    /// funnel cannot produce enough candidates.
    pub full_scan_threshold: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            coarse_cap: 1000,
            fine_cap: 100,
            expansion_factor: 2.0,
            max_expansions: 3,
            full_scan_threshold: 10_000,
        }
    }
}

impl FunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.coarse_cap == 0 || self.fine_cap == 0 {
            return Err(AnchorageError::invalid_config(
                "funnel caps must be positive",
            ));
        }
        if self.fine_cap > self.coarse_cap {
            return Err(AnchorageError::invalid_config(format!(
                "fine cap ({}) must not exceed coarse cap ({})",
                self.fine_cap, self.coarse_cap
            )));
        }
        if !(self.expansion_factor.is_finite() && self.expansion_factor > 1.0) {
            return Err(AnchorageError::invalid_config(format!(
                "expansion factor must be greater than 1, got {}",
                self.expansion_factor
            )));
        }
        Ok(())
    }
}

/// How distances are turned into weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// `exp(-d / T)`, normalized through log-sum-exp.
    Softmax { temperature: f64 },
    /// `1 / (1 + d)`, normalized.
    Inverse,
}

impl Default for Weighting {
    fn default() -> Self {
        Weighting::Softmax { temperature: 1.0 }
    }
}

impl Weighting {
    pub fn validate(&self) -> Result<()> {
        if let Weighting::Softmax { temperature } = self
            && !(temperature.is_finite() && *temperature > 0.0)
        {
            return Err(AnchorageError::invalid_config(format!(
                "temperature must be finite and positive, got {temperature}"
            )));
        }
        Ok(())
    }
}

/// How one candidate is picked from the weight distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Highest weight, ties broken by rank.
    #[default]
    Argmax,
    /// Draw proportionally to weight.
    Weighted,
    /// Draw within the smallest prefix whose cumulative weight reaches `top_p`.
    Nucleus { top_p: f64 },
}

impl Selection {
    pub fn validate(&self) -> Result<()> {
        if let Selection::Nucleus { top_p } = self
            && !(*top_p > 0.0 && *top_p <= 1.0)
        {
            return Err(AnchorageError::invalid_config(format!(
                "top_p must be in (0, 1], got {top_p}"
            )));
        }
        Ok(())
    }
}

/// Attention sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub weighting: Weighting,
    pub selection: Selection,
    /// Number of draws (with replacement) per call.
    pub draws: usize,
    /// Seed for random selection modes; `None` uses the thread RNG.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            weighting: Weighting::default(),
            selection: Selection::default(),
            draws: 1,
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        self.weighting.validate()?;
        self.selection.validate()?;
        if self.draws == 0 {
            return Err(AnchorageError::invalid_config("draws must be positive"));
        }
        Ok(())
    }
}

/// Geometric median iteration bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedianConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for MedianConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

/// Generation loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Items kept in the sliding context window.
    pub window_size: usize,
    /// Candidates retrieved per step.
    pub candidates_per_step: usize,
    /// Skip candidates that are already in the window.
    pub avoid_repeats: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            window_size: 512,
            candidates_per_step: 16,
            avoid_repeats: true,
        }
    }
}

/// Top-level configuration of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Metric used for projection and exact rerank alike.
    pub metric: DistanceMetric,
    pub anchors: AnchorConfig,
    pub index: IndexConfig,
    pub funnel: FunnelConfig,
    pub sampler: SamplerConfig,
    pub median: MedianConfig,
    pub generation: GenerationConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.anchors.count == 0 {
            return Err(AnchorageError::invalid_config(
                "anchor count must be positive",
            ));
        }
        if self.index.coarse_leaf_size == 0 || self.index.fine_leaf_size == 0 {
            return Err(AnchorageError::invalid_config("leaf sizes must be positive"));
        }
        if self.index.fine_leaf_size > self.index.coarse_leaf_size {
            return Err(AnchorageError::invalid_config(
                "fine leaves must not be larger than coarse leaves",
            ));
        }
        if !(self.index.rebuild_ratio > 0.0 && self.index.compaction_ratio > 0.0) {
            return Err(AnchorageError::invalid_config(
                "rebuild and compaction ratios must be positive",
            ));
        }
        if self.median.max_iterations == 0 {
            return Err(AnchorageError::invalid_config(
                "median iterations must be positive",
            ));
        }
        if self.generation.window_size == 0 || self.generation.candidates_per_step == 0 {
            return Err(AnchorageError::invalid_config(
                "generation window and candidate count must be positive",
            ));
        }
        self.funnel.validate()?;
        self.sampler.validate()
    }
}
