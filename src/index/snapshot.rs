//! Immutable, published state of a hybrid index.

use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::anchor::{AnchorSet, ProjectedCoordinate};
use crate::config::IndexConfig;
use crate::error::{AnchorageError, Result};
use crate::exact::{ExactBackend, FlatVectorStore};
use crate::index::segments::{SlotIndex, SlotTable, TombstoneBits};
use crate::item::{IndexEntry, ItemId, ItemMetadata};
use crate::spatial::{KdTree, SpatialBackend};
use crate::vector::{DistanceMetric, Embedding};

/// Per-item bookkeeping held by a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    /// Position in the snapshot's slot table and tombstone bitmap.
    pub slot: usize,
    pub coordinate: ProjectedCoordinate,
    pub metadata: ItemMetadata,
}

/// One slot of the snapshot's slot table.
#[derive(Debug, Clone)]
struct Slot {
    id: ItemId,
    record: Arc<ItemRecord>,
}

/// Why maintenance should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceReason {
    /// Too many points were appended since the last rebuild.
    AppendRatio,
    /// Too many points are tombstoned.
    TombstoneRatio,
    /// A caller asked for it.
    Manual,
}

/// A consistent view of one collection's index.
///
/// Snapshots are never mutated once published; writers clone the current
/// one, apply staged operations and swap the result in. Every table is
/// copy-on-write, so a clone shares all unchanged structure with its source
/// and a commit copies only the chunks, cells and recent appends it touches.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    generation: u64,
    anchors: Arc<AnchorSet>,
    coarse: KdTree,
    fine: KdTree,
    exact: FlatVectorStore,
    slots: SlotTable<Slot>,
    index: SlotIndex,
    tombstones: TombstoneBits,
    tombstoned: usize,
    built_len: usize,
    appended_since_rebuild: usize,
}

impl IndexSnapshot {
    /// An empty snapshot over `anchors`.
    pub fn empty(anchors: Arc<AnchorSet>, config: &IndexConfig) -> Result<Self> {
        Self::build(anchors, config, Vec::new(), 0)
    }

    /// Bulk-build a snapshot from live entries.
    pub fn build(
        anchors: Arc<AnchorSet>,
        config: &IndexConfig,
        entries: Vec<IndexEntry>,
        generation: u64,
    ) -> Result<Self> {
        let arity = anchors.len();
        let mut exact =
            FlatVectorStore::new(anchors.dimension(), anchors.metric(), config.max_exact_dimension)?;
        let mut lookup = AHashMap::with_capacity(entries.len());
        let mut slots = SlotTable::with_capacity(entries.len());
        let mut tombstones = TombstoneBits::default();

        for entry in &entries {
            validate_entry(entry, &anchors)?;
            if lookup.contains_key(&entry.id) {
                return Err(AnchorageError::index(format!(
                    "item {} appears more than once",
                    entry.id
                )));
            }
            exact.insert(entry.id, entry.embedding.clone())?;
            let slot = slots.len();
            slots.push(Slot {
                id: entry.id,
                record: Arc::new(ItemRecord {
                    slot,
                    coordinate: entry.coordinate.clone(),
                    metadata: entry.metadata.clone(),
                }),
            });
            tombstones.push(false);
            lookup.insert(entry.id, slot);
        }
        exact.seal();

        let points = || entries.iter().map(|e| (e.id, e.coordinate.as_slice()));
        let coarse = KdTree::build(arity, config.coarse_leaf_size, points())?;
        let fine = KdTree::build(arity, config.fine_leaf_size, points())?;

        Ok(Self {
            generation,
            anchors,
            coarse,
            fine,
            exact,
            index: SlotIndex::sealed(lookup),
            tombstones,
            built_len: slots.len(),
            slots,
            tombstoned: 0,
            appended_since_rebuild: 0,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn anchors(&self) -> &Arc<AnchorSet> {
        &self.anchors
    }

    pub fn anchor_version(&self) -> u64 {
        self.anchors.version()
    }

    /// Embedding dimension of the collection.
    pub fn dimension(&self) -> usize {
        self.exact.dimension()
    }

    pub fn metric(&self) -> DistanceMetric {
        self.exact.metric()
    }

    pub fn coarse(&self) -> &KdTree {
        &self.coarse
    }

    pub fn fine(&self) -> &KdTree {
        &self.fine
    }

    pub fn exact(&self) -> &FlatVectorStore {
        &self.exact
    }

    /// Items held, live or tombstoned.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.tombstoned
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstoned
    }

    pub fn appended_since_rebuild(&self) -> usize {
        self.appended_since_rebuild
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.index.contains(id)
    }

    pub fn is_live(&self, id: ItemId) -> bool {
        self.index
            .get(id)
            .is_some_and(|slot| !self.tombstones.get(slot))
    }

    pub fn is_tombstoned(&self, id: ItemId) -> bool {
        self.index.get(id).is_some_and(|slot| self.tombstones.get(slot))
    }

    pub fn record(&self, id: ItemId) -> Option<&ItemRecord> {
        let slot = self.index.get(id)?;
        self.slots.get(slot).map(|entry| entry.record.as_ref())
    }

    pub fn embedding(&self, id: ItemId) -> Option<&Embedding> {
        self.exact.get(id)
    }

    /// Live ids in slot order.
    pub fn live_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(slot, _)| !self.tombstones.get(*slot))
            .map(|(_, entry)| entry.id)
    }

    /// Live items as insertable entries, in slot order.
    pub fn live_entries(&self) -> Result<Vec<IndexEntry>> {
        self.live_ids()
            .map(|id| {
                let record = self.record(id);
                let embedding = self.exact.get(id);
                match (record, embedding) {
                    (Some(record), Some(embedding)) => Ok(IndexEntry::new(
                        id,
                        embedding.clone(),
                        record.coordinate.clone(),
                        record.metadata.clone(),
                    )),
                    _ => Err(AnchorageError::index(format!(
                        "item {id} is missing from the exact store"
                    ))),
                }
            })
            .collect()
    }

    /// Which maintenance, if any, the thresholds in `config` call for.
    pub fn maintenance_reason(&self, config: &IndexConfig) -> Option<MaintenanceReason> {
        let total = self.slots.len();
        if total > 0 && self.tombstoned as f64 > config.compaction_ratio * total as f64 {
            return Some(MaintenanceReason::TombstoneRatio);
        }
        let baseline = self.built_len.max(config.coarse_leaf_size);
        if self.appended_since_rebuild as f64 > config.rebuild_ratio * baseline as f64 {
            return Some(MaintenanceReason::AppendRatio);
        }
        None
    }

    /// Rebuild from live items only, dropping tombstones physically.
    pub fn compacted(&self, config: &IndexConfig) -> Result<Self> {
        Self::build(
            self.anchors.clone(),
            config,
            self.live_entries()?,
            self.generation + 1,
        )
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Append one entry, descending the existing trees into the owning leaves.
    pub(crate) fn insert(&mut self, entry: &IndexEntry) -> Result<()> {
        validate_entry(entry, &self.anchors)?;
        if self.index.contains(entry.id) {
            return Err(AnchorageError::index(format!(
                "item {} is already indexed",
                entry.id
            )));
        }
        self.exact.insert(entry.id, entry.embedding.clone())?;
        self.coarse.insert(entry.id, entry.coordinate.as_slice())?;
        self.fine.insert(entry.id, entry.coordinate.as_slice())?;

        let slot = self.slots.push(Slot {
            id: entry.id,
            record: Arc::new(ItemRecord {
                slot: self.slots.len(),
                coordinate: entry.coordinate.clone(),
                metadata: entry.metadata.clone(),
            }),
        });
        self.tombstones.push(false);
        self.index.insert(entry.id, slot);
        self.appended_since_rebuild += 1;
        Ok(())
    }

    /// Tombstone an item. Returns `false` when it already was.
    pub(crate) fn tombstone(&mut self, id: ItemId) -> Result<bool> {
        let slot = self.slot_of(id)?;
        if self.tombstones.get(slot) {
            return Ok(false);
        }
        self.tombstones.set(slot, true);
        self.tombstoned += 1;
        Ok(true)
    }

    /// Adjust a live item's reference count, tombstoning it when the count
    /// reaches zero.
    ///
    /// Returns `true` only when this call tombstoned the item. Tombstoned
    /// items are left untouched.
    pub(crate) fn adjust_references(&mut self, id: ItemId, delta: i64) -> Result<bool> {
        let slot = self.slot_of(id)?;
        if self.tombstones.get(slot) {
            return Ok(false);
        }
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| AnchorageError::index(format!("slot {slot} of item {id} is missing")))?;
        let record = Arc::make_mut(&mut entry.record);
        let count =
            (i64::from(record.metadata.reference_count) + delta).clamp(0, i64::from(u32::MAX));
        record.metadata.reference_count = count as u32;
        if count == 0 {
            return self.tombstone(id);
        }
        Ok(false)
    }

    fn slot_of(&self, id: ItemId) -> Result<usize> {
        self.index
            .get(id)
            .ok_or_else(|| AnchorageError::not_found(format!("item {id}")))
    }
}

fn validate_entry(entry: &IndexEntry, anchors: &AnchorSet) -> Result<()> {
    entry.embedding.ensure_dimension(anchors.dimension())?;
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::ProjectionEngine;

    fn anchors() -> Arc<AnchorSet> {
        Arc::new(
            AnchorSet::new(
                vec![
                    Embedding::new(vec![0.0, 0.0]).unwrap(),
                    Embedding::new(vec![5.0, 6.0]).unwrap(),
                ],
                DistanceMetric::Euclidean,
            )
            .unwrap(),
        )
    }

    fn entry(anchors: &AnchorSet, id: ItemId, point: [f32; 2]) -> IndexEntry {
        let embedding = Embedding::new(point.to_vec()).unwrap();
        let coordinate = ProjectionEngine::new().project(&embedding, anchors).unwrap();
        IndexEntry::new(id, embedding, coordinate, ItemMetadata::default())
    }

    #[test]
    fn test_build_and_lookup() {
        let anchors = anchors();
        let entries = vec![entry(&anchors, 1, [0.0, 0.0]), entry(&anchors, 2, [5.0, 5.0])];
        let snapshot = IndexSnapshot::build(anchors, &IndexConfig::default(), entries, 3).unwrap();
        assert_eq!(snapshot.generation(), 3);
        assert_eq!(snapshot.live_count(), 2);
        assert!(snapshot.is_live(1));
        assert_eq!(snapshot.record(2).unwrap().slot, 1);
        assert_eq!(snapshot.embedding(2).unwrap().as_slice(), &[5.0, 5.0]);
    }

    #[test]
    fn test_rejects_stale_coordinate() {
        let anchors = anchors();
        let mut stale = entry(&anchors, 1, [1.0, 1.0]);
        stale.coordinate.anchor_version = 9;
        let err = IndexSnapshot::build(anchors, &IndexConfig::default(), vec![stale], 0).unwrap_err();
        assert!(matches!(
            err,
            AnchorageError::StaleCoordinate {
                expected: 0,
                actual: 9
            }
        ));
    }

    #[test]
    fn test_tombstone_and_compaction() {
        let anchors = anchors();
        let config = IndexConfig::default();
        let mut snapshot = IndexSnapshot::empty(anchors.clone(), &config).unwrap();
        for id in 0..10u64 {
            snapshot.insert(&entry(&anchors, id, [id as f32, 1.0])).unwrap();
        }
        assert!(snapshot.tombstone(3).unwrap());
        assert!(!snapshot.tombstone(3).unwrap());
        assert!(snapshot.is_tombstoned(3));
        assert_eq!(snapshot.live_count(), 9);
        assert!(snapshot.tombstone(42).is_err());

        let compacted = snapshot.compacted(&config).unwrap();
        assert_eq!(compacted.len(), 9);
        assert!(!compacted.contains(3));
        assert_eq!(compacted.tombstone_count(), 0);
        assert_eq!(compacted.coarse().len(), 9);
        assert_eq!(compacted.exact().len(), 9);
    }

    #[test]
    fn test_release_to_zero_tombstones() {
        let anchors = anchors();
        let config = IndexConfig::default();
        let mut snapshot = IndexSnapshot::empty(anchors.clone(), &config).unwrap();
        snapshot.insert(&entry(&anchors, 7, [2.0, 2.0])).unwrap();
        let count = |s: &IndexSnapshot| s.record(7).unwrap().metadata.reference_count;
        assert!(!snapshot.adjust_references(7, 1).unwrap());
        assert_eq!(count(&snapshot), 2);
        assert!(!snapshot.adjust_references(7, -1).unwrap());
        assert!(snapshot.adjust_references(7, -1).unwrap());
        assert!(snapshot.is_tombstoned(7));
        assert_eq!(snapshot.tombstone_count(), 1);

        // A dead item ignores further adjustments in either direction.
        assert!(!snapshot.adjust_references(7, -1).unwrap());
        assert!(!snapshot.adjust_references(7, 1).unwrap());
        assert_eq!(count(&snapshot), 0);
        assert_eq!(snapshot.tombstone_count(), 1);
        assert!(snapshot.adjust_references(8, 1).is_err());
    }

    #[test]
    fn test_clone_shares_untouched_structure() {
        let anchors = anchors();
        let config = IndexConfig::default();
        let entries = (0..3000u64)
            .map(|id| entry(&anchors, id, [(id % 50) as f32, (id / 50) as f32]))
            .collect();
        let base = IndexSnapshot::build(anchors.clone(), &config, entries, 1).unwrap();

        let mut next = base.clone();
        next.insert(&entry(&anchors, 5000, [0.5, 0.5])).unwrap();
        next.tombstone(2500).unwrap();
        next.adjust_references(10, 1).unwrap();

        assert!(next.index.shares_sealed(&base.index));
        assert!(std::ptr::eq(
            base.embedding(1).unwrap(),
            next.embedding(1).unwrap()
        ));
        // Chunk 0 was copied for the reference change, chunk 1 was not touched.
        assert!(!next.slots.shares_chunk(&base.slots, 10));
        assert!(next.slots.shares_chunk(&base.slots, 1500));
        assert!(std::ptr::eq(base.record(11).unwrap(), next.record(11).unwrap()));
        assert!(!std::ptr::eq(base.record(10).unwrap(), next.record(10).unwrap()));

        assert_eq!(base.record(10).unwrap().metadata.reference_count, 1);
        assert!(base.is_live(2500));
        assert!(!base.contains(5000));
        assert_eq!(next.len(), 3001);
        assert_eq!(next.record(5000).unwrap().slot, 3000);
        assert_eq!(next.exact().recent_len(), 1);
    }

    #[test]
    fn test_maintenance_thresholds() {
        let anchors = anchors();
        let config = IndexConfig {
            coarse_leaf_size: 4,
            fine_leaf_size: 2,
            rebuild_ratio: 0.5,
            compaction_ratio: 0.3,
            ..IndexConfig::default()
        };
        let mut snapshot = IndexSnapshot::empty(anchors.clone(), &config).unwrap();
        snapshot.insert(&entry(&anchors, 1, [1.0, 0.0])).unwrap();
        snapshot.insert(&entry(&anchors, 2, [2.0, 0.0])).unwrap();
        assert_eq!(snapshot.maintenance_reason(&config), None);
        snapshot.insert(&entry(&anchors, 3, [3.0, 0.0])).unwrap();
        assert_eq!(
            snapshot.maintenance_reason(&config),
            Some(MaintenanceReason::AppendRatio)
        );

        snapshot.tombstone(1).unwrap();
        snapshot.tombstone(2).unwrap();
        assert_eq!(
            snapshot.maintenance_reason(&config),
            Some(MaintenanceReason::TombstoneRatio)
        );
    }
}
