//! Coarse -> fine -> exact candidate funnel.

use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use log::{debug, warn};
use rayon::prelude::*;

use crate::anchor::ProjectionEngine;
use crate::config::FunnelConfig;
use crate::error::{AnchorageError, Result};
use crate::exact::ExactBackend;
use crate::index::IndexSnapshot;
use crate::item::ItemId;
use crate::search::result::{
    FunnelStats, SearchHit, SearchRequest, SearchResults, SearchStage, SearchStatus,
};
use crate::spatial::{CellScan, Neighbor, SpatialBackend};

/// Multi-resolution search over an [`IndexSnapshot`].
///
/// 1. Coarse: visit coarse-tree cells nearest-first in projected space until
///    C1 candidates are gathered or the cell budget is spent.
/// 2. Fine: k-NN in the fine tree, restricted to the coarse candidates,
///    keeping C2.
/// 3. Exact: rerank the fine candidates by true distance and keep K.
///
/// Tombstones and metadata filters are applied as candidate predicates in
/// every stage.
#[derive(Debug, Clone)]
pub struct MultiResolutionSearch {
    config: FunnelConfig,
    projection: ProjectionEngine,
}

impl MultiResolutionSearch {
    pub fn new(config: FunnelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            projection: ProjectionEngine::new(),
        })
    }

    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    pub fn search(&self, snapshot: &IndexSnapshot, request: &SearchRequest) -> Result<SearchResults> {
        let start = Instant::now();
        if request.k == 0 {
            return Err(AnchorageError::invalid_argument("k must be positive"));
        }
        request.query.ensure_dimension(snapshot.dimension())?;

        let k = request.k;
        let coarse_cap = request.coarse_cap.unwrap_or(self.config.coarse_cap).max(k);
        let fine_cap = request
            .fine_cap
            .unwrap_or(self.config.fine_cap)
            .max(k)
            .min(coarse_cap);

        let mut stats = FunnelStats {
            snapshot_generation: snapshot.generation(),
            ..FunnelStats::default()
        };
        let live = snapshot.live_count();
        if live == 0 {
            stats.elapsed_ms = elapsed_ms(start);
            return Ok(SearchResults::no_candidates(SearchStage::Coarse, stats));
        }

        let coordinate = self.projection.project(&request.query, snapshot.anchors())?;
        let filter = request.filter.as_ref();
        let accept = |id: ItemId| {
            snapshot.is_live(id)
                && filter.is_none_or(|f| {
                    snapshot
                        .record(id)
                        .is_some_and(|record| f.matches(&record.metadata))
                })
        };

        // Coarse stage, widening the cell budget when it comes up short.
        let needed = k.min(live);
        let leaf_size = snapshot.coarse().leaf_size();
        let mut cell_budget = coarse_cap.div_ceil(leaf_size) + 1;
        let mut scan: CellScan;
        loop {
            scan = snapshot.coarse().collect_cells(
                coordinate.as_slice(),
                coarse_cap,
                cell_budget,
                &accept,
            )?;
            if scan.candidates.len() >= needed
                || scan.exhausted
                || stats.expansions >= self.config.max_expansions
            {
                break;
            }
            stats.expansions += 1;
            cell_budget = ((cell_budget as f64) * self.config.expansion_factor).ceil() as usize;
        }
        scan.candidates.truncate(coarse_cap);
        stats.coarse_cells = scan.cells_visited;
        stats.coarse_candidates = scan.candidates.len();
        debug!(
            "coarse stage: {} candidates from {} cells ({} expansions)",
            stats.coarse_candidates, stats.coarse_cells, stats.expansions
        );

        if scan.candidates.len() < needed && !scan.exhausted {
            if live <= self.config.full_scan_threshold {
                warn!(
                    "coarse stage found {} of {needed} candidates; falling back to a full scan of {live} items",
                    scan.candidates.len()
                );
                return self.full_scan(snapshot, request, &coordinate, &accept, stats, start);
            }
            warn!(
                "coarse stage found {} of {needed} candidates over {live} items; results will be partial",
                scan.candidates.len()
            );
        }
        if scan.candidates.is_empty() {
            stats.elapsed_ms = elapsed_ms(start);
            return Ok(SearchResults::no_candidates(SearchStage::Coarse, stats));
        }

        // Fine stage over the coarse survivors.
        let coarse_ids: AHashSet<ItemId> = scan.candidates.iter().map(|n| n.id).collect();
        let fine = snapshot.fine().nearest(
            coordinate.as_slice(),
            fine_cap,
            &|id| coarse_ids.contains(&id),
        )?;
        stats.fine_candidates = fine.len();
        debug!("fine stage: {} candidates", stats.fine_candidates);
        if fine.is_empty() {
            stats.elapsed_ms = elapsed_ms(start);
            return Ok(SearchResults::no_candidates(SearchStage::Fine, stats));
        }

        // Exact rerank.
        let fine_ids: Vec<ItemId> = fine.iter().map(|n| n.id).collect();
        let mut exact = snapshot.exact().distances(&request.query, &fine_ids)?;
        stats.exact_candidates = exact.len();
        exact.truncate(k);
        if exact.is_empty() {
            stats.elapsed_ms = elapsed_ms(start);
            return Ok(SearchResults::no_candidates(SearchStage::Exact, stats));
        }

        let projected: AHashMap<ItemId, f32> = fine.iter().map(|n| (n.id, n.distance)).collect();
        let hits = self.hits(snapshot, request, exact, |id| {
            projected.get(&id).copied().unwrap_or(f32::MAX)
        });

        let status = if hits.len() < needed && !scan.exhausted {
            SearchStatus::Partial {
                requested: k,
                returned: hits.len(),
            }
        } else {
            SearchStatus::Complete
        };
        stats.elapsed_ms = elapsed_ms(start);
        Ok(SearchResults {
            hits,
            status,
            stats,
        })
    }

    /// Run many searches against one snapshot on the rayon pool.
    pub fn search_batch(
        &self,
        snapshot: &IndexSnapshot,
        requests: &[SearchRequest],
    ) -> Result<Vec<SearchResults>> {
        requests
            .par_iter()
            .map(|request| self.search(snapshot, request))
            .collect()
    }

    fn full_scan(
        &self,
        snapshot: &IndexSnapshot,
        request: &SearchRequest,
        coordinate: &crate::anchor::ProjectedCoordinate,
        accept: &(dyn Fn(ItemId) -> bool + Sync),
        mut stats: FunnelStats,
        start: Instant,
    ) -> Result<SearchResults> {
        stats.full_scan = true;
        let exact = snapshot.exact().nearest(&request.query, request.k, accept)?;
        stats.exact_candidates = exact.len();
        if exact.is_empty() {
            stats.elapsed_ms = elapsed_ms(start);
            return Ok(SearchResults::no_candidates(SearchStage::Exact, stats));
        }
        let hits = self.hits(snapshot, request, exact, |id| {
            snapshot
                .record(id)
                .map(|record| projected_distance(coordinate.as_slice(), record.coordinate.as_slice()))
                .unwrap_or(f32::MAX)
        });
        stats.elapsed_ms = elapsed_ms(start);
        Ok(SearchResults {
            hits,
            status: SearchStatus::Complete,
            stats,
        })
    }

    fn hits<F>(
        &self,
        snapshot: &IndexSnapshot,
        request: &SearchRequest,
        scored: Vec<Neighbor>,
        projected: F,
    ) -> Vec<SearchHit>
    where
        F: Fn(ItemId) -> f32,
    {
        scored
            .into_iter()
            .filter_map(|neighbor| {
                let record = snapshot.record(neighbor.id)?;
                Some(SearchHit {
                    id: neighbor.id,
                    distance: neighbor.distance,
                    projected_distance: projected(neighbor.id),
                    embedding: if request.include_embeddings {
                        snapshot.embedding(neighbor.id).cloned()
                    } else {
                        None
                    },
                    metadata: record.metadata.clone(),
                })
            })
            .collect()
    }
}

fn projected_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::anchor::{AnchorSelector, AnchorSet};
    use crate::config::IndexConfig;
    use crate::index::HybridIndex;
    use crate::item::{IndexEntry, ItemMetadata};
    use crate::search::MetadataFilter;
    use crate::vector::{DistanceMetric, Embedding};

    fn build(points: &[[f32; 2]], anchor_count: usize, config: IndexConfig) -> HybridIndex {
        let embeddings: Vec<Embedding> = points
            .iter()
            .map(|p| Embedding::new(p.to_vec()).unwrap())
            .collect();
        let selection = AnchorSelector::new(anchor_count, DistanceMetric::Euclidean)
            .select(&embeddings)
            .unwrap();
        let anchors = Arc::new(AnchorSet::from_selection(selection, 1).unwrap());
        let index = HybridIndex::new(anchors.clone(), config).unwrap();
        for (id, embedding) in embeddings.into_iter().enumerate() {
            let coordinate = ProjectionEngine::new().project(&embedding, &anchors).unwrap();
            let metadata = ItemMetadata::default()
                .with_attribute("parity", if id % 2 == 0 { "even" } else { "odd" });
            index
                .insert(IndexEntry::new(id as ItemId, embedding, coordinate, metadata))
                .unwrap();
        }
        index.commit().unwrap();
        index
    }

    fn query(values: [f32; 2]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_small_corpus_end_to_end() {
        let index = build(
            &[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [5.0, 6.0]],
            2,
            IndexConfig::default(),
        );
        let search = MultiResolutionSearch::new(FunnelConfig {
            coarse_cap: 5,
            fine_cap: 3,
            ..FunnelConfig::default()
        })
        .unwrap();

        let results = search
            .search(&index.snapshot(), &SearchRequest::new(query([4.0, 5.0]), 1))
            .unwrap();
        assert_eq!(results.status, SearchStatus::Complete);
        assert_eq!(results.ids(), vec![3]);
        assert!((results.hits[0].distance - 1.0).abs() < 1e-6);
        assert_eq!(results.stats.coarse_candidates, 5);
        assert_eq!(results.stats.fine_candidates, 3);
        assert!(!results.stats.full_scan);
    }

    #[test]
    fn test_empty_index_has_no_candidates() {
        let anchors = Arc::new(
            AnchorSet::new(vec![query([1.0, 1.0])], DistanceMetric::Euclidean).unwrap(),
        );
        let index = HybridIndex::new(anchors, IndexConfig::default()).unwrap();
        let results = MultiResolutionSearch::new(FunnelConfig::default())
            .unwrap()
            .search(&index.snapshot(), &SearchRequest::new(query([0.0, 0.0]), 3))
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(
            results.status,
            SearchStatus::NoCandidates {
                stage: SearchStage::Coarse
            }
        );
    }

    #[test]
    fn test_exact_match_is_not_no_candidates() {
        let index = build(&[[1.0, 2.0], [3.0, 4.0]], 2, IndexConfig::default());
        let results = MultiResolutionSearch::new(FunnelConfig::default())
            .unwrap()
            .search(&index.snapshot(), &SearchRequest::new(query([1.0, 2.0]), 1))
            .unwrap();
        assert_eq!(results.status, SearchStatus::Complete);
        assert_eq!(results.hits[0].distance, 0.0);
    }

    #[test]
    fn test_filters_and_tombstones_apply() {
        let points: Vec<[f32; 2]> = (0..40).map(|i| [i as f32, (i % 5) as f32]).collect();
        let index = build(&points, 3, IndexConfig::default());
        index.delete(10).unwrap();
        index.commit().unwrap();

        let search = MultiResolutionSearch::new(FunnelConfig::default()).unwrap();
        let request = SearchRequest::new(query([10.0, 0.0]), 4)
            .with_filter(MetadataFilter::new().with_attribute("parity", "even"));
        let results = search.search(&index.snapshot(), &request).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.hits.iter().all(|h| h.id % 2 == 0 && h.id != 10));
    }

    #[test]
    fn test_cell_budget_expands_then_falls_back() {
        let points: Vec<[f32; 2]> = (0..200)
            .map(|i| [(i % 20) as f32, (i / 20) as f32])
            .collect();
        let config = IndexConfig {
            coarse_leaf_size: 4,
            fine_leaf_size: 2,
            ..IndexConfig::default()
        };
        let index = build(&points, 2, config);
        index.delete(0).unwrap();
        index.commit().unwrap();

        // Only odd items pass, so 16 cells (24 after one expansion) of at
        // most four points cannot yield 60 candidates.
        let search = MultiResolutionSearch::new(FunnelConfig {
            coarse_cap: 4,
            fine_cap: 4,
            expansion_factor: 1.5,
            max_expansions: 1,
            full_scan_threshold: 10_000,
        })
        .unwrap();
        let request = SearchRequest::new(query([0.0, 0.0]), 60)
            .with_filter(MetadataFilter::new().with_attribute("parity", "odd"));
        let results = search.search(&index.snapshot(), &request).unwrap();
        assert_eq!(results.len(), 60);
        assert!(results.stats.expansions >= 1);
        assert!(results.stats.full_scan);
        assert!(results.hits.iter().all(|h| h.id % 2 == 1));
        assert!(results.hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_partial_above_full_scan_threshold() {
        let points: Vec<[f32; 2]> = (0..200)
            .map(|i| [(i % 20) as f32, (i / 20) as f32])
            .collect();
        let config = IndexConfig {
            coarse_leaf_size: 4,
            fine_leaf_size: 2,
            ..IndexConfig::default()
        };
        let index = build(&points, 2, config);
        let search = MultiResolutionSearch::new(FunnelConfig {
            coarse_cap: 4,
            fine_cap: 4,
            expansion_factor: 2.0,
            max_expansions: 0,
            full_scan_threshold: 10,
        })
        .unwrap();
        // Only 100 items are odd, so 150 hits are out of reach.
        let request = SearchRequest::new(query([0.0, 0.0]), 150)
            .with_filter(MetadataFilter::new().with_attribute("parity", "odd"));
        let results = search.search(&index.snapshot(), &request).unwrap();
        assert!(!results.stats.full_scan);
        assert!(!results.is_empty());
        assert!(matches!(
            results.status,
            SearchStatus::Partial { requested: 150, returned } if returned < 150
        ));
    }

    #[test]
    fn test_dimension_mismatch_and_zero_k() {
        let index = build(&[[1.0, 2.0], [3.0, 4.0]], 2, IndexConfig::default());
        let search = MultiResolutionSearch::new(FunnelConfig::default()).unwrap();
        let snapshot = index.snapshot();
        assert!(matches!(
            search.search(&snapshot, &SearchRequest::new(Embedding::new(vec![1.0; 3]).unwrap(), 1)),
            Err(AnchorageError::DimensionMismatch { .. })
        ));
        assert!(search.search(&snapshot, &SearchRequest::new(query([1.0, 2.0]), 0)).is_err());
    }

    #[test]
    fn test_batch_matches_sequential() {
        let points: Vec<[f32; 2]> = (0..100).map(|i| [(i as f32).sin() * 10.0, (i as f32).cos() * 10.0]).collect();
        let index = build(&points, 3, IndexConfig::default());
        let search = MultiResolutionSearch::new(FunnelConfig::default()).unwrap();
        let snapshot = index.snapshot();
        let requests: Vec<SearchRequest> = (0..8)
            .map(|i| SearchRequest::new(query([i as f32, -(i as f32)]), 5))
            .collect();
        let batch = search.search_batch(&snapshot, &requests).unwrap();
        for (request, results) in requests.iter().zip(&batch) {
            assert_eq!(search.search(&snapshot, request).unwrap().ids(), results.ids());
        }
    }
}
