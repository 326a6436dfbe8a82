//! Collections partitioned by embedding dimension.
//!
//! Embeddings of different dimensions are never compared, padded or
//! truncated: each dimension gets its own [`Collection`] named
//! `<name>-d<dimension>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use log::info;
use parking_lot::RwLock;

use crate::anchor::ProjectedCoordinate;
use crate::collection::core::Collection;
use crate::config::EngineConfig;
use crate::error::{AnchorageError, Result};
use crate::index::CommitSummary;
use crate::item::{ItemId, ItemMetadata};
use crate::search::{SearchRequest, SearchResults};
use crate::storage::Storage;
use crate::vector::Embedding;

#[derive(Debug)]
pub struct PartitionedCollections {
    name: String,
    config: EngineConfig,
    partitions: RwLock<BTreeMap<usize, Arc<Collection>>>,
}

impl PartitionedCollections {
    pub fn new<S: Into<String>>(name: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            partitions: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_name(&self, dimension: usize) -> String {
        format!("{}-d{dimension}", self.name)
    }

    /// Dimensions that have a partition, ascending.
    pub fn dimensions(&self) -> Vec<usize> {
        self.partitions.read().keys().copied().collect()
    }

    pub fn partition(&self, dimension: usize) -> Option<Arc<Collection>> {
        self.partitions.read().get(&dimension).cloned()
    }

    fn require_partition(&self, dimension: usize) -> Result<Arc<Collection>> {
        self.partition(dimension).ok_or_else(|| {
            AnchorageError::not_found(format!(
                "{} has no partition for dimension {dimension}",
                self.name
            ))
        })
    }

    pub fn get_or_create(&self, dimension: usize) -> Result<Arc<Collection>> {
        if let Some(existing) = self.partition(dimension) {
            return Ok(existing);
        }
        let mut partitions = self.partitions.write();
        if let Some(existing) = partitions.get(&dimension) {
            return Ok(existing.clone());
        }
        let collection = Arc::new(Collection::new(
            self.partition_name(dimension),
            dimension,
            self.config.clone(),
        )?);
        partitions.insert(dimension, collection.clone());
        info!("created partition {}", collection.name());
        Ok(collection)
    }

    /// Group `sample` by dimension and bootstrap anchors for every partition
    /// that has none yet. Returns the dimensions that were bootstrapped.
    pub fn bootstrap(&self, sample: &[Embedding]) -> Result<Vec<usize>> {
        let mut groups: AHashMap<usize, Vec<Embedding>> = AHashMap::new();
        for embedding in sample {
            groups
                .entry(embedding.dimension())
                .or_default()
                .push(embedding.clone());
        }
        let mut dimensions: Vec<usize> = groups.keys().copied().collect();
        dimensions.sort_unstable();

        let mut bootstrapped = Vec::new();
        for dimension in dimensions {
            let collection = self.get_or_create(dimension)?;
            if collection.is_bootstrapped() {
                continue;
            }
            collection.bootstrap_anchors(&groups[&dimension])?;
            bootstrapped.push(dimension);
        }
        Ok(bootstrapped)
    }

    /// Route one item to the partition of its dimension.
    pub fn ingest(
        &self,
        id: ItemId,
        embedding: Embedding,
        metadata: ItemMetadata,
    ) -> Result<ProjectedCoordinate> {
        self.require_partition(embedding.dimension())?
            .ingest(id, embedding, metadata)
    }

    /// Commit every partition, ascending by dimension.
    pub fn commit_all(&self) -> Result<Vec<(usize, CommitSummary)>> {
        let partitions: Vec<(usize, Arc<Collection>)> = self
            .partitions
            .read()
            .iter()
            .map(|(d, c)| (*d, c.clone()))
            .collect();
        partitions
            .into_iter()
            .filter(|(_, collection)| collection.is_bootstrapped())
            .map(|(dimension, collection)| Ok((dimension, collection.commit()?)))
            .collect()
    }

    /// Search the partition matching the query's dimension.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        self.require_partition(request.query.dimension())?
            .search(request)
    }

    /// Save every partition.
    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        let partitions: Vec<Arc<Collection>> = self.partitions.read().values().cloned().collect();
        for collection in partitions {
            collection.save(storage)?;
        }
        Ok(())
    }

    /// Load the partitions of `dimensions` saved under this set's name.
    pub fn load(
        storage: &dyn Storage,
        name: &str,
        config: EngineConfig,
        dimensions: &[usize],
    ) -> Result<Self> {
        let set = Self::new(name, config)?;
        {
            let mut partitions = set.partitions.write();
            for dimension in dimensions {
                let collection = Collection::load(storage, &set.partition_name(*dimension))?;
                if collection.dimension() != *dimension {
                    return Err(AnchorageError::dimension_mismatch(
                        *dimension,
                        collection.dimension(),
                    ));
                }
                partitions.insert(*dimension, Arc::new(collection));
            }
        }
        Ok(set)
    }
}
