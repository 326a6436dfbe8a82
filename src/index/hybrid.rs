//! The writable hybrid index: staged writes, atomic snapshot publication,
//! rebuilds and re-projection.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashSet;
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::anchor::{AnchorSet, ProjectionEngine};
use crate::config::IndexConfig;
use crate::error::{AnchorageError, Result};
use crate::index::maintenance::MaintenanceTask;
use crate::index::snapshot::{IndexSnapshot, MaintenanceReason};
use crate::item::{IndexEntry, ItemId};
use crate::vector::{DistanceMetric, Embedding};

#[derive(Debug, Clone)]
enum PendingOp {
    Insert(IndexEntry),
    Delete(ItemId),
    Retain(ItemId),
    Release(ItemId),
}

#[derive(Debug, Default)]
struct PendingWrites {
    ops: Vec<PendingOp>,
    inserted: AHashSet<ItemId>,
}

impl PendingWrites {
    fn clear(&mut self) {
        self.ops.clear();
        self.inserted.clear();
    }
}

/// Outcome of one [`HybridIndex::commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub generation: u64,
    pub inserted: usize,
    pub deleted: usize,
    /// A tombstoned id was re-inserted, so the snapshot was compacted first.
    pub compacted: bool,
    /// Maintenance that the commit triggered, inline or queued.
    pub maintenance: Option<MaintenanceReason>,
}

/// Point-in-time counters of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub generation: u64,
    pub anchor_version: u64,
    pub items: usize,
    pub live: usize,
    pub tombstoned: usize,
    pub pending: usize,
    pub coarse_cells: usize,
    pub fine_cells: usize,
    pub appended_since_rebuild: usize,
}

/// Coarse and fine kd-trees over projected coordinates plus a flat exact
/// store over embeddings, published as immutable snapshots.
///
/// Readers call [`snapshot`](Self::snapshot) and never wait for writers:
/// the read lock is held only to clone the `Arc`. Writes are staged and
/// become visible together on [`commit`](Self::commit).
#[derive(Debug)]
pub struct HybridIndex {
    config: IndexConfig,
    dimension: usize,
    metric: DistanceMetric,
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<PendingWrites>,
    maintenance: Mutex<Option<Sender<MaintenanceTask>>>,
}

impl HybridIndex {
    /// Create an empty index over `anchors`.
    pub fn new(anchors: Arc<AnchorSet>, config: IndexConfig) -> Result<Self> {
        let snapshot = IndexSnapshot::empty(anchors, &config)?;
        Ok(Self::from_snapshot(snapshot, config))
    }

    /// Create an index pre-populated with `entries`.
    pub fn with_entries(
        anchors: Arc<AnchorSet>,
        config: IndexConfig,
        entries: Vec<IndexEntry>,
    ) -> Result<Self> {
        let snapshot = IndexSnapshot::build(anchors, &config, entries, 1)?;
        Ok(Self::from_snapshot(snapshot, config))
    }

    fn from_snapshot(snapshot: IndexSnapshot, config: IndexConfig) -> Self {
        Self {
            dimension: snapshot.dimension(),
            metric: snapshot.metric(),
            config,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(PendingWrites::default()),
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    /// Number of staged, uncommitted operations.
    pub fn pending(&self) -> usize {
        self.writer.lock().ops.len()
    }

    /// Stage an insert.
    ///
    /// The embedding must have the index dimension and the coordinate must
    /// have been projected against the current anchor set.
    pub fn insert(&self, entry: IndexEntry) -> Result<()> {
        entry.embedding.ensure_dimension(self.dimension)?;
        let mut pending = self.writer.lock();
        let snapshot = self.snapshot();

        let anchors = snapshot.anchors();
        if entry.coordinate.arity() != anchors.len() {
            return Err(AnchorageError::dimension_mismatch(
                anchors.len(),
                entry.coordinate.arity(),
            ));
        }
        if entry.coordinate.anchor_version != anchors.version() {
            return Err(AnchorageError::StaleCoordinate {
                expected: anchors.version(),
                actual: entry.coordinate.anchor_version,
            });
        }
        if snapshot.is_live(entry.id) || pending.inserted.contains(&entry.id) {
            return Err(AnchorageError::index(format!(
                "item {} is already indexed",
                entry.id
            )));
        }

        pending.inserted.insert(entry.id);
        pending.ops.push(PendingOp::Insert(entry));
        Ok(())
    }

    /// Stage a logical delete.
    pub fn delete(&self, id: ItemId) -> Result<()> {
        self.stage(id, PendingOp::Delete(id))
    }

    /// Stage a reference-count increment.
    pub fn retain(&self, id: ItemId) -> Result<()> {
        self.stage(id, PendingOp::Retain(id))
    }

    /// Stage a reference-count decrement. The item is tombstoned when its
    /// count reaches zero.
    pub fn release(&self, id: ItemId) -> Result<()> {
        self.stage(id, PendingOp::Release(id))
    }

    fn stage(&self, id: ItemId, op: PendingOp) -> Result<()> {
        let mut pending = self.writer.lock();
        if !self.snapshot().is_live(id) && !pending.inserted.contains(&id) {
            return Err(AnchorageError::not_found(format!("item {id}")));
        }
        pending.ops.push(op);
        Ok(())
    }

    /// Publish every staged operation as a new snapshot.
    pub fn commit(&self) -> Result<CommitSummary> {
        let mut pending = self.writer.lock();
        let current = self.snapshot();
        if pending.ops.is_empty() {
            return Ok(CommitSummary {
                generation: current.generation(),
                inserted: 0,
                deleted: 0,
                compacted: false,
                maintenance: None,
            });
        }

        let reinserts_tombstoned = pending.inserted.iter().any(|id| current.contains(*id));
        // The clone shares every table with `current` until a write touches it.
        let mut next = if reinserts_tombstoned {
            current.compacted(&self.config)?
        } else {
            (*current).clone()
        };

        let mut inserted = 0;
        let mut deleted = 0;
        for op in &pending.ops {
            match op {
                PendingOp::Insert(entry) => {
                    next.insert(entry)?;
                    inserted += 1;
                }
                PendingOp::Delete(id) => {
                    if next.tombstone(*id)? {
                        deleted += 1;
                    }
                }
                PendingOp::Retain(id) => {
                    next.adjust_references(*id, 1)?;
                }
                PendingOp::Release(id) => {
                    if next.adjust_references(*id, -1)? {
                        deleted += 1;
                    }
                }
            }
        }
        next.set_generation(current.generation() + 1);
        let generation = next.generation();
        let maintenance = next.maintenance_reason(&self.config);

        *self.current.write() = Arc::new(next);
        pending.clear();
        debug!(
            "committed generation {generation}: {inserted} inserted, {deleted} deleted{}",
            if reinserts_tombstoned { ", compacted" } else { "" }
        );

        if let Some(reason) = maintenance {
            self.schedule_maintenance(reason)?;
        }

        Ok(CommitSummary {
            generation,
            inserted,
            deleted,
            compacted: reinserts_tombstoned,
            maintenance,
        })
    }

    /// Queue maintenance on an attached worker, or run it inline.
    fn schedule_maintenance(&self, reason: MaintenanceReason) -> Result<()> {
        if self.config.background_maintenance
            && let Some(sender) = self.maintenance.lock().as_ref()
        {
            match sender.try_send(MaintenanceTask::Rebuild { reason }) {
                Ok(()) => return Ok(()),
                // A rebuild is already queued and will pick up this commit.
                Err(TrySendError::Full(_)) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => {
                    warn!("maintenance worker is gone; rebuilding inline");
                }
            }
        }
        self.rebuild_locked(reason)
    }

    /// Rebuild both trees and the exact store from live items.
    pub fn rebuild(&self) -> Result<u64> {
        let _pending = self.writer.lock();
        self.rebuild_locked(MaintenanceReason::Manual)?;
        Ok(self.snapshot().generation())
    }

    /// Rebuild while the caller holds the writer lock.
    pub(crate) fn rebuild_locked(&self, reason: MaintenanceReason) -> Result<()> {
        let start = Instant::now();
        let current = self.snapshot();
        let next = current.compacted(&self.config)?;
        let removed = current.len() - next.len();
        let generation = next.generation();
        *self.current.write() = Arc::new(next);
        info!(
            "rebuilt index ({reason:?}) at generation {generation}: {} live, {removed} tombstones dropped in {:.2}ms",
            current.live_count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    /// Run a rebuild on behalf of the maintenance worker.
    pub(crate) fn run_maintenance(&self, reason: MaintenanceReason) -> Result<u64> {
        let _pending = self.writer.lock();
        self.rebuild_locked(reason)?;
        Ok(self.snapshot().generation())
    }

    /// Recompute every coordinate against `anchors` and publish the result.
    ///
    /// Tombstoned items are dropped; staged inserts are re-projected so they
    /// can still be committed afterwards.
    pub fn reproject(&self, anchors: Arc<AnchorSet>) -> Result<u64> {
        if anchors.dimension() != self.dimension {
            return Err(AnchorageError::dimension_mismatch(
                self.dimension,
                anchors.dimension(),
            ));
        }
        if anchors.metric() != self.metric {
            return Err(AnchorageError::invalid_argument(format!(
                "anchor metric {} does not match index metric {}",
                anchors.metric().name(),
                self.metric.name()
            )));
        }

        let start = Instant::now();
        let mut pending = self.writer.lock();
        let current = self.snapshot();
        let engine = ProjectionEngine::new();

        let mut entries = current.live_entries()?;
        let embeddings: Vec<Embedding> = entries.iter().map(|e| e.embedding.clone()).collect();
        let coordinates = engine.project_batch(&embeddings, &anchors)?;
        for (entry, coordinate) in entries.iter_mut().zip(coordinates) {
            entry.coordinate = coordinate;
        }
        let next = IndexSnapshot::build(
            anchors.clone(),
            &self.config,
            entries,
            current.generation() + 1,
        )?;

        for op in pending.ops.iter_mut() {
            if let PendingOp::Insert(entry) = op {
                entry.coordinate = engine.project(&entry.embedding, &anchors)?;
            }
        }

        let generation = next.generation();
        let live = next.live_count();
        *self.current.write() = Arc::new(next);
        info!(
            "re-projected {live} items onto anchor version {} in {:.2}ms",
            anchors.version(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(generation)
    }

    pub(crate) fn attach_maintenance(&self, sender: Sender<MaintenanceTask>) {
        *self.maintenance.lock() = Some(sender);
    }

    pub(crate) fn detach_maintenance(&self) {
        self.maintenance.lock().take();
    }

    pub fn stats(&self) -> IndexStats {
        let pending = self.pending();
        let snapshot = self.snapshot();
        IndexStats {
            generation: snapshot.generation(),
            anchor_version: snapshot.anchor_version(),
            items: snapshot.len(),
            live: snapshot.live_count(),
            tombstoned: snapshot.tombstone_count(),
            pending,
            coarse_cells: snapshot.coarse().leaf_count(),
            fine_cells: snapshot.fine().leaf_count(),
            appended_since_rebuild: snapshot.appended_since_rebuild(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::ProjectedCoordinate;
    use crate::item::ItemMetadata;

    fn anchors(version: u64) -> Arc<AnchorSet> {
        Arc::new(
            AnchorSet::new(
                vec![
                    Embedding::new(vec![0.0, 0.0]).unwrap(),
                    Embedding::new(vec![5.0, 6.0]).unwrap(),
                ],
                DistanceMetric::Euclidean,
            )
            .unwrap()
            .with_version(version),
        )
    }

    fn entry(anchors: &AnchorSet, id: ItemId, point: [f32; 2]) -> IndexEntry {
        let embedding = Embedding::new(point.to_vec()).unwrap();
        let coordinate = ProjectionEngine::new().project(&embedding, anchors).unwrap();
        IndexEntry::new(id, embedding, coordinate, ItemMetadata::default())
    }

    #[test]
    fn test_writes_are_invisible_until_commit() {
        let anchors = anchors(1);
        let index = HybridIndex::new(anchors.clone(), IndexConfig::default()).unwrap();
        index.insert(entry(&anchors, 1, [1.0, 1.0])).unwrap();
        assert_eq!(index.snapshot().live_count(), 0);
        assert_eq!(index.pending(), 1);

        let before = index.snapshot();
        let summary = index.commit().unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.generation, 1);
        assert_eq!(index.snapshot().live_count(), 1);
        assert_eq!(before.live_count(), 0);
    }

    #[test]
    fn test_insert_validation() {
        let anchors = anchors(1);
        let index = HybridIndex::new(anchors.clone(), IndexConfig::default()).unwrap();

        let wrong_dim = IndexEntry::new(
            1,
            Embedding::new(vec![1.0, 2.0, 3.0]).unwrap(),
            ProjectedCoordinate::new(vec![0.0, 0.0], 1),
            ItemMetadata::default(),
        );
        assert!(matches!(
            index.insert(wrong_dim),
            Err(AnchorageError::DimensionMismatch { .. })
        ));

        let mut stale = entry(&anchors, 2, [1.0, 1.0]);
        stale.coordinate.anchor_version = 0;
        assert!(matches!(
            index.insert(stale),
            Err(AnchorageError::StaleCoordinate {
                expected: 1,
                actual: 0
            })
        ));

        index.insert(entry(&anchors, 3, [1.0, 1.0])).unwrap();
        assert!(index.insert(entry(&anchors, 3, [2.0, 2.0])).is_err());
        index.commit().unwrap();
        assert!(index.insert(entry(&anchors, 3, [2.0, 2.0])).is_err());
    }

    #[test]
    fn test_delete_and_reinsert_compacts() {
        let anchors = anchors(1);
        let index = HybridIndex::new(anchors.clone(), IndexConfig::default()).unwrap();
        for id in 0..5 {
            index.insert(entry(&anchors, id, [id as f32, 0.5])).unwrap();
        }
        index.commit().unwrap();

        index.delete(2).unwrap();
        index.commit().unwrap();
        assert!(index.snapshot().is_tombstoned(2));
        assert!(index.delete(2).is_err());

        index.insert(entry(&anchors, 2, [9.0, 9.0])).unwrap();
        let summary = index.commit().unwrap();
        assert!(summary.compacted);
        let snapshot = index.snapshot();
        assert!(snapshot.is_live(2));
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.embedding(2).unwrap().as_slice(), &[9.0, 9.0]);
    }

    #[test]
    fn test_reference_counting() {
        let anchors = anchors(1);
        let index = HybridIndex::new(anchors.clone(), IndexConfig::default()).unwrap();
        index.insert(entry(&anchors, 1, [1.0, 1.0])).unwrap();
        index.commit().unwrap();

        index.retain(1).unwrap();
        index.release(1).unwrap();
        index.commit().unwrap();
        assert!(index.snapshot().is_live(1));

        index.release(1).unwrap();
        let summary = index.commit().unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(!index.snapshot().is_live(1));
    }

    #[test]
    fn test_reference_changes_after_release_within_one_commit() {
        let anchors = anchors(1);
        let index = HybridIndex::new(anchors.clone(), IndexConfig::default()).unwrap();
        for id in 0..10 {
            index.insert(entry(&anchors, id, [id as f32, 1.0])).unwrap();
        }
        index.commit().unwrap();

        // Both staged against a live item; the second release finds it dead.
        index.release(1).unwrap();
        index.release(1).unwrap();
        index.release(2).unwrap();
        index.retain(2).unwrap();
        let summary = index.commit().unwrap();
        assert_eq!(summary.deleted, 2);

        let snapshot = index.snapshot();
        assert_eq!(snapshot.tombstone_count(), 2);
        assert!(!snapshot.is_live(2));
        assert_eq!(snapshot.record(2).unwrap().metadata.reference_count, 0);
    }

    #[test]
    fn test_commit_shares_unchanged_items() {
        let anchors = anchors(1);
        let index = HybridIndex::new(anchors.clone(), IndexConfig::default()).unwrap();
        for id in 0..50 {
            index.insert(entry(&anchors, id, [id as f32, 2.0])).unwrap();
        }
        index.commit().unwrap();
        index.rebuild().unwrap();

        let before = index.snapshot();
        index.insert(entry(&anchors, 50, [0.5, 0.5])).unwrap();
        index.delete(7).unwrap();
        index.commit().unwrap();
        let after = index.snapshot();

        assert!(std::ptr::eq(before.embedding(3).unwrap(), after.embedding(3).unwrap()));
        assert!(std::ptr::eq(before.record(3).unwrap(), after.record(3).unwrap()));
        assert!(before.is_live(7) && !after.is_live(7));
        assert!(after.is_live(50));
    }

    #[test]
    fn test_inline_rebuild_on_tombstone_ratio() {
        let anchors = anchors(1);
        let config = IndexConfig {
            compaction_ratio: 0.2,
            ..IndexConfig::default()
        };
        let index = HybridIndex::new(anchors.clone(), config).unwrap();
        for id in 0..10 {
            index.insert(entry(&anchors, id, [id as f32, 1.0])).unwrap();
        }
        index.commit().unwrap();
        for id in 0..3 {
            index.delete(id).unwrap();
        }
        let summary = index.commit().unwrap();
        assert_eq!(summary.maintenance, Some(MaintenanceReason::TombstoneRatio));

        let stats = index.stats();
        assert_eq!(stats.items, 7);
        assert_eq!(stats.tombstoned, 0);
    }

    #[test]
    fn test_reproject_updates_coordinates() {
        let v1 = anchors(1);
        let index = HybridIndex::new(v1.clone(), IndexConfig::default()).unwrap();
        index.insert(entry(&v1, 1, [3.0, 4.0])).unwrap();
        index.commit().unwrap();
        index.insert(entry(&v1, 2, [1.0, 1.0])).unwrap();

        let v2 = Arc::new(
            AnchorSet::new(
                vec![
                    Embedding::new(vec![3.0, 4.0]).unwrap(),
                    Embedding::new(vec![0.0, 0.0]).unwrap(),
                ],
                DistanceMetric::Euclidean,
            )
            .unwrap()
            .with_version(2),
        );
        index.reproject(v2.clone()).unwrap();

        let snapshot = index.snapshot();
        assert_eq!(snapshot.anchor_version(), 2);
        let record = snapshot.record(1).unwrap();
        assert_eq!(record.coordinate.anchor_version, 2);
        assert!(record.coordinate.values[0].abs() < 1e-6);

        // The staged insert was re-projected and still commits.
        index.commit().unwrap();
        assert!(index.snapshot().is_live(2));
    }
}
