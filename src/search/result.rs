//! Search requests and results.

use serde::{Deserialize, Serialize};

use crate::item::{ItemId, ItemMetadata};
use crate::search::filter::MetadataFilter;
use crate::vector::Embedding;

/// A k-nearest-neighbor request against one collection.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Embedding,
    pub k: usize,
    pub filter: Option<MetadataFilter>,
    /// Overrides the configured coarse cap (C1).
    pub coarse_cap: Option<usize>,
    /// Overrides the configured fine cap (C2).
    pub fine_cap: Option<usize>,
    /// Attach each hit's embedding to the result.
    pub include_embeddings: bool,
}

impl SearchRequest {
    pub fn new(query: Embedding, k: usize) -> Self {
        Self {
            query,
            k,
            filter: None,
            coarse_cap: None,
            fine_cap: None,
            include_embeddings: false,
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = (!filter.is_empty()).then_some(filter);
        self
    }

    pub fn with_caps(mut self, coarse_cap: usize, fine_cap: usize) -> Self {
        self.coarse_cap = Some(coarse_cap);
        self.fine_cap = Some(fine_cap);
        self
    }

    pub fn with_embeddings(mut self, include: bool) -> Self {
        self.include_embeddings = include;
        self
    }
}

/// Funnel stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStage {
    Coarse,
    Fine,
    Exact,
}

/// How complete a result is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Complete,
    /// The funnel could not produce `requested` hits within its caps.
    Partial { requested: usize, returned: usize },
    /// A stage produced no candidates at all.
    NoCandidates { stage: SearchStage },
}

/// One scored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: ItemId,
    /// True distance under the collection metric.
    pub distance: f32,
    /// Distance between the projected coordinates of query and item.
    pub projected_distance: f32,
    pub embedding: Option<Embedding>,
    pub metadata: ItemMetadata,
}

/// Per-stage counters of one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelStats {
    pub snapshot_generation: u64,
    pub coarse_candidates: usize,
    pub coarse_cells: usize,
    pub fine_candidates: usize,
    pub exact_candidates: usize,
    /// Number of times the coarse cell budget was widened.
    pub expansions: usize,
    /// The funnel was bypassed by an exact scan of every live item.
    pub full_scan: bool,
    pub elapsed_ms: f64,
}

/// Hits sorted by `(distance, id)`, with status and stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub status: SearchStatus,
    pub stats: FunnelStats,
}

impl SearchResults {
    pub fn no_candidates(stage: SearchStage, stats: FunnelStats) -> Self {
        Self {
            hits: Vec::new(),
            status: SearchStatus::NoCandidates { stage },
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.hits.iter().map(|hit| hit.id).collect()
    }

    pub fn best(&self) -> Option<&SearchHit> {
        self.hits.first()
    }

    pub fn is_complete(&self) -> bool {
        self.status == SearchStatus::Complete
    }
}
