//! One collection: anchors, projection, hybrid index and search for a single
//! embedding dimension.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::anchor::{
    AnchorRegistry, AnchorSelector, AnchorSet, ProjectedCoordinate, ProjectionEngine,
};
use crate::attention::{AttentionResult, AttentionSampler};
use crate::config::EngineConfig;
use crate::error::{AnchorageError, Result};
use crate::index::{CommitSummary, HybridIndex, IndexSnapshot, IndexStats, MaintenanceWorker};
use crate::item::{IndexEntry, ItemId, ItemMetadata};
use crate::search::{FunnelStats, MultiResolutionSearch, SearchRequest, SearchResults, SearchStage};
use crate::vector::{DistanceMetric, Embedding};

/// Point-in-time summary of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub anchor_version: u64,
    pub reduced_fidelity: bool,
    /// `None` until anchors are bootstrapped.
    pub index: Option<IndexStats>,
}

/// A named set of items sharing one embedding dimension.
///
/// Items are only indexable once an anchor set exists, either from
/// [`bootstrap_anchors`](Self::bootstrap_anchors) or from a loaded
/// manifest. Anchor migrations hold the migration lock exclusively;
/// ingestion holds it shared, so no item is ever inserted with a coordinate
/// from a set that is being replaced. Searches never take it.
#[derive(Debug)]
pub struct Collection {
    name: String,
    dimension: usize,
    config: EngineConfig,
    registry: AnchorRegistry,
    projection: ProjectionEngine,
    index: RwLock<Option<Arc<HybridIndex>>>,
    search: MultiResolutionSearch,
    sampler: AttentionSampler,
    migration: RwLock<()>,
    worker: Mutex<Option<MaintenanceWorker>>,
}

impl Collection {
    pub fn new<S: Into<String>>(name: S, dimension: usize, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        if name.is_empty() {
            return Err(AnchorageError::invalid_argument("collection name is empty"));
        }
        if dimension == 0 {
            return Err(AnchorageError::invalid_argument("dimension must be positive"));
        }
        if dimension > config.index.max_exact_dimension {
            return Err(AnchorageError::invalid_argument(format!(
                "dimension {dimension} exceeds max_exact_dimension {}",
                config.index.max_exact_dimension
            )));
        }
        Ok(Self {
            search: MultiResolutionSearch::new(config.funnel.clone())?,
            sampler: AttentionSampler::new(config.sampler.clone())?,
            name,
            dimension,
            config,
            registry: AnchorRegistry::new(),
            projection: ProjectionEngine::new(),
            index: RwLock::new(None),
            migration: RwLock::new(()),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.config.metric
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AnchorRegistry {
        &self.registry
    }

    pub fn anchors(&self) -> Option<Arc<AnchorSet>> {
        self.registry.current()
    }

    pub fn anchor_version(&self) -> u64 {
        self.registry.version()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.index.read().is_some()
    }

    pub fn index(&self) -> Option<Arc<HybridIndex>> {
        self.index.read().clone()
    }

    fn require_index(&self) -> Result<Arc<HybridIndex>> {
        self.index().ok_or_else(|| {
            AnchorageError::not_found(format!(
                "collection {} has no anchor set; bootstrap anchors first",
                self.name
            ))
        })
    }

    /// Current index snapshot, if the collection is bootstrapped.
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.index().map(|index| index.snapshot())
    }

    fn select_anchors(&self, sample: &[Embedding], version: u64) -> Result<AnchorSet> {
        if let Some(bad) = sample.iter().find(|e| e.dimension() != self.dimension) {
            return Err(AnchorageError::dimension_mismatch(self.dimension, bad.dimension()));
        }
        let selection = AnchorSelector::from_config(&self.config.anchors, self.config.metric)
            .select(sample)?;
        AnchorSet::from_selection(selection, version)
    }

    /// Choose the first anchor set from `sample` and create the index.
    pub fn bootstrap_anchors(&self, sample: &[Embedding]) -> Result<Arc<AnchorSet>> {
        let _migration = self.migration.write();
        if self.is_bootstrapped() {
            return Err(AnchorageError::invalid_argument(format!(
                "collection {} already has anchors; use migrate_anchors",
                self.name
            )));
        }
        let set = self.select_anchors(sample, 1)?;
        let anchors = self.registry.install(set);
        let index = Arc::new(HybridIndex::new(anchors.clone(), self.config.index.clone())?);
        self.attach_index(index)?;
        info!(
            "bootstrapped collection {} with {} anchors (dimension {})",
            self.name,
            anchors.len(),
            self.dimension
        );
        Ok(anchors)
    }

    /// Install a persisted anchor set and index `items` against it.
    pub(crate) fn restore(
        &self,
        set: AnchorSet,
        items: Vec<(ItemId, Embedding, ItemMetadata)>,
    ) -> Result<()> {
        let _migration = self.migration.write();
        if set.dimension() != self.dimension {
            return Err(AnchorageError::dimension_mismatch(self.dimension, set.dimension()));
        }
        if set.metric() != self.config.metric {
            return Err(AnchorageError::invalid_config(format!(
                "stored anchors use {} but the collection is configured for {}",
                set.metric().name(),
                self.config.metric.name()
            )));
        }
        let anchors = self.registry.restore(set)?;
        let embeddings: Vec<Embedding> = items.iter().map(|(_, e, _)| e.clone()).collect();
        let coordinates = self.projection.project_batch(&embeddings, &anchors)?;
        let entries = items
            .into_iter()
            .zip(coordinates)
            .map(|((id, embedding, metadata), coordinate)| {
                IndexEntry::new(id, embedding, coordinate, metadata)
            })
            .collect();
        let index = Arc::new(HybridIndex::with_entries(
            anchors,
            self.config.index.clone(),
            entries,
        )?);
        self.attach_index(index)
    }

    fn attach_index(&self, index: Arc<HybridIndex>) -> Result<()> {
        if self.config.index.background_maintenance {
            let worker = MaintenanceWorker::start(&index)?;
            if let Some(previous) = self.worker.lock().replace(worker) {
                previous.stop()?;
            }
        }
        *self.index.write() = Some(index);
        Ok(())
    }

    /// Choose a new anchor set from `sample`, re-project every item onto it
    /// and make it current.
    ///
    /// Readers keep using the previous snapshot until the swap.
    pub fn migrate_anchors(&self, sample: &[Embedding]) -> Result<Arc<AnchorSet>> {
        let _migration = self.migration.write();
        let index = self.require_index()?;
        let set = self.select_anchors(sample, self.registry.version() + 1)?;
        let next = Arc::new(set);
        index.reproject(next.clone())?;
        let installed = self.registry.install((*next).clone());
        info!(
            "migrated collection {} to anchor version {}",
            self.name,
            installed.version()
        );
        Ok(installed)
    }

    /// Project one embedding against the current anchor set.
    pub fn project_embedding(&self, embedding: &Embedding) -> Result<ProjectedCoordinate> {
        embedding.ensure_dimension(self.dimension)?;
        let anchors = self.registry.require_current()?;
        self.projection.project(embedding, &anchors)
    }

    /// Stage an already projected entry.
    ///
    /// Fails with `StaleCoordinate` when a migration has happened since the
    /// coordinate was computed.
    pub fn index_insert(&self, entry: IndexEntry) -> Result<()> {
        let _migration = self.migration.read();
        self.require_index()?.insert(entry)
    }

    /// Project and stage one item.
    pub fn ingest(
        &self,
        id: ItemId,
        embedding: Embedding,
        metadata: ItemMetadata,
    ) -> Result<ProjectedCoordinate> {
        let _migration = self.migration.read();
        let index = self.require_index()?;
        let coordinate = self.project_embedding(&embedding)?;
        index.insert(IndexEntry::new(id, embedding, coordinate.clone(), metadata))?;
        Ok(coordinate)
    }

    /// Project (in parallel) and stage many items. Stops at the first
    /// rejected item; items staged before it stay staged.
    pub fn ingest_batch(&self, items: Vec<(ItemId, Embedding, ItemMetadata)>) -> Result<usize> {
        let _migration = self.migration.read();
        let index = self.require_index()?;
        let anchors = self.registry.require_current()?;
        for (_, embedding, _) in &items {
            embedding.ensure_dimension(self.dimension)?;
        }
        let embeddings: Vec<Embedding> = items.iter().map(|(_, e, _)| e.clone()).collect();
        let coordinates = self.projection.project_batch(&embeddings, &anchors)?;
        let count = items.len();
        for ((id, embedding, metadata), coordinate) in items.into_iter().zip(coordinates) {
            index.insert(IndexEntry::new(id, embedding, coordinate, metadata))?;
        }
        debug!("staged {count} items in collection {}", self.name);
        Ok(count)
    }

    pub fn commit(&self) -> Result<CommitSummary> {
        self.require_index()?.commit()
    }

    pub fn delete(&self, id: ItemId) -> Result<()> {
        self.require_index()?.delete(id)
    }

    pub fn retain(&self, id: ItemId) -> Result<()> {
        self.require_index()?.retain(id)
    }

    pub fn release(&self, id: ItemId) -> Result<()> {
        self.require_index()?.release(id)
    }

    /// Force a rebuild of the index.
    pub fn rebuild(&self) -> Result<u64> {
        self.require_index()?.rebuild()
    }

    /// Run the funnel against the current snapshot.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        request.query.ensure_dimension(self.dimension)?;
        match self.snapshot() {
            Some(snapshot) => self.search.search(&snapshot, request),
            None => Ok(SearchResults::no_candidates(
                SearchStage::Coarse,
                FunnelStats::default(),
            )),
        }
    }

    pub fn search_batch(&self, requests: &[SearchRequest]) -> Result<Vec<SearchResults>> {
        for request in requests {
            request.query.ensure_dimension(self.dimension)?;
        }
        match self.snapshot() {
            Some(snapshot) => self.search.search_batch(&snapshot, requests),
            None => Ok(requests
                .iter()
                .map(|_| SearchResults::no_candidates(SearchStage::Coarse, FunnelStats::default()))
                .collect()),
        }
    }

    /// Search, then sample over the hits with the configured sampler.
    pub fn attend(&self, request: &SearchRequest) -> Result<AttentionResult> {
        let results = self.search(request)?;
        self.sampler.sample_results(&results)
    }

    pub fn sampler(&self) -> &AttentionSampler {
        &self.sampler
    }

    pub fn stats(&self) -> CollectionStats {
        let anchors = self.anchors();
        CollectionStats {
            name: self.name.clone(),
            dimension: self.dimension,
            metric: self.config.metric,
            anchor_version: anchors.as_ref().map(|a| a.version()).unwrap_or(0),
            reduced_fidelity: anchors.as_ref().is_some_and(|a| a.reduced_fidelity()),
            index: self.index().map(|index| index.stats()),
        }
    }

    /// Stop the background maintenance worker, if any.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchStatus;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    fn corpus() -> Vec<Embedding> {
        [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [5.0, 6.0]]
            .iter()
            .map(|p| embedding(p))
            .collect()
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.anchors.count = 2;
        config
    }

    fn populated() -> Collection {
        let collection = Collection::new("points", 2, config()).unwrap();
        collection.bootstrap_anchors(&corpus()).unwrap();
        for (id, e) in corpus().into_iter().enumerate() {
            collection.ingest(id as ItemId, e, ItemMetadata::default()).unwrap();
        }
        collection.commit().unwrap();
        collection
    }

    #[test]
    fn test_construction_checks() {
        assert!(Collection::new("", 2, config()).is_err());
        assert!(Collection::new("x", 0, config()).is_err());
        assert!(Collection::new("x", 2001, config()).is_err());
    }

    #[test]
    fn test_requires_anchors() {
        let collection = Collection::new("points", 2, config()).unwrap();
        assert!(!collection.is_bootstrapped());
        assert!(matches!(
            collection.ingest(0, embedding(&[1.0, 1.0]), ItemMetadata::default()),
            Err(AnchorageError::NotFound(_))
        ));
        let results = collection
            .search(&SearchRequest::new(embedding(&[1.0, 1.0]), 1))
            .unwrap();
        assert_eq!(
            results.status,
            SearchStatus::NoCandidates {
                stage: SearchStage::Coarse
            }
        );
    }

    #[test]
    fn test_search_and_attend() {
        let collection = populated();
        let anchors = collection.anchors().unwrap();
        assert_eq!(anchors.version(), 1);
        assert_eq!(anchors.len(), 2);

        let request = SearchRequest::new(embedding(&[4.0, 5.0]), 1).with_caps(5, 3);
        let results = collection.search(&request).unwrap();
        assert_eq!(results.ids(), vec![3]);
        assert_eq!(collection.attend(&request).unwrap().first(), Some(3));

        assert!(collection.bootstrap_anchors(&corpus()).is_err());
        assert!(matches!(
            collection.search(&SearchRequest::new(embedding(&[1.0, 2.0, 3.0]), 1)),
            Err(AnchorageError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_migration_reprojects_and_rejects_stale_coordinates() {
        let collection = populated();
        let stale = collection.project_embedding(&embedding(&[2.0, 2.0])).unwrap();
        assert_eq!(stale.anchor_version, 1);

        let migrated = collection
            .migrate_anchors(&[embedding(&[0.0, 1.0]), embedding(&[5.0, 5.0]), embedding(&[1.0, 0.0])])
            .unwrap();
        assert_eq!(migrated.version(), 2);
        assert_eq!(collection.anchor_version(), 2);
        assert_eq!(collection.registry().history().len(), 2);
        assert_eq!(collection.snapshot().unwrap().anchor_version(), 2);

        let result = collection.index_insert(IndexEntry::new(
            10,
            embedding(&[2.0, 2.0]),
            stale,
            ItemMetadata::default(),
        ));
        assert!(matches!(
            result,
            Err(AnchorageError::StaleCoordinate {
                expected: 2,
                actual: 1
            })
        ));

        let results = collection
            .search(&SearchRequest::new(embedding(&[4.0, 5.0]), 1))
            .unwrap();
        assert_eq!(results.ids(), vec![3]);
    }

    #[test]
    fn test_batch_ingest_and_stats() {
        let collection = Collection::new("batch", 2, config()).unwrap();
        collection.bootstrap_anchors(&corpus()).unwrap();
        let items = corpus()
            .into_iter()
            .enumerate()
            .map(|(id, e)| (id as ItemId, e, ItemMetadata::default()))
            .collect();
        assert_eq!(collection.ingest_batch(items).unwrap(), 5);
        collection.commit().unwrap();
        collection.delete(0).unwrap();
        collection.commit().unwrap();

        let stats = collection.stats();
        assert_eq!(stats.anchor_version, 1);
        let index = stats.index.unwrap();
        assert_eq!(index.live, 4);
        assert_eq!(index.pending, 0);
    }
}
