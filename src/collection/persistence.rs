//! Saving and loading collections through a [`Storage`].
//!
//! A saved collection is two streams:
//!
//! - `<name>.items.bin`: bincode-encoded live items (id, embedding, metadata)
//! - `<name>.manifest.json`: configuration, the anchor set and the CRC32 of
//!   the item log
//!
//! The item log is written first and the manifest last, each through a
//! temporary stream and a rename. The pair is not replaced atomically: a
//! crash between the two renames leaves the previous manifest next to the
//! new log, and loading then fails the CRC32 check instead of returning a
//! mix of both saves. Coordinates are not stored; they are recomputed from
//! the stored anchor set on load.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::anchor::AnchorSet;
use crate::collection::core::Collection;
use crate::config::EngineConfig;
use crate::error::{AnchorageError, Result};
use crate::item::{ItemId, ItemMetadata};
use crate::storage::{Storage, read_all, write_atomic};
use crate::vector::Embedding;

/// Version of the on-storage layout.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub format_version: u32,
    pub name: String,
    pub dimension: usize,
    pub config: EngineConfig,
    /// `None` for a collection saved before bootstrap.
    pub anchors: Option<AnchorSet>,
    pub item_count: usize,
    pub items_bytes: u64,
    pub items_checksum: u32,
    /// Index generation at save time.
    pub generation: u64,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredItem {
    id: ItemId,
    embedding: Embedding,
    metadata: ItemMetadata,
}

pub fn manifest_name(collection: &str) -> String {
    format!("{collection}.manifest.json")
}

pub fn items_name(collection: &str) -> String {
    format!("{collection}.items.bin")
}

impl Collection {
    /// Persist the committed state. Staged, uncommitted writes are not saved.
    pub fn save(&self, storage: &dyn Storage) -> Result<CollectionManifest> {
        let anchors = self.anchors();
        let snapshot = self.snapshot();
        let mut items: Vec<StoredItem> = match &snapshot {
            Some(snapshot) => snapshot
                .live_entries()?
                .into_iter()
                .map(|entry| StoredItem {
                    id: entry.id,
                    embedding: entry.embedding,
                    metadata: entry.metadata,
                })
                .collect(),
            None => Vec::new(),
        };
        items.sort_by_key(|item| item.id);

        let bytes = bincode::serialize(&items)?;
        let manifest = CollectionManifest {
            format_version: FORMAT_VERSION,
            name: self.name().to_string(),
            dimension: self.dimension(),
            config: self.config().clone(),
            // The snapshot's set is the one its items were projected with.
            anchors: snapshot
                .as_ref()
                .map(|s| s.anchors().as_ref().clone())
                .or_else(|| anchors.map(|a| a.as_ref().clone())),
            item_count: items.len(),
            items_bytes: bytes.len() as u64,
            items_checksum: crc32fast::hash(&bytes),
            generation: snapshot.as_ref().map(|s| s.generation()).unwrap_or(0),
            saved_at: Utc::now(),
        };

        write_atomic(storage, &items_name(self.name()), &bytes)?;
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(storage, &manifest_name(self.name()), &json)?;
        info!(
            "saved collection {} ({} items, {} bytes)",
            manifest.name, manifest.item_count, manifest.items_bytes
        );
        Ok(manifest)
    }

    /// Read only the manifest of a saved collection.
    pub fn read_manifest(storage: &dyn Storage, name: &str) -> Result<CollectionManifest> {
        let manifest: CollectionManifest =
            serde_json::from_slice(&read_all(storage, &manifest_name(name))?)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(AnchorageError::storage(format!(
                "unsupported collection format version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        if manifest.name != name {
            return Err(AnchorageError::storage(format!(
                "manifest {} describes collection {}",
                manifest_name(name),
                manifest.name
            )));
        }
        Ok(manifest)
    }

    /// Load a saved collection, verifying the item log checksum and
    /// re-projecting every item onto the stored anchor set.
    pub fn load(storage: &dyn Storage, name: &str) -> Result<Self> {
        let manifest = Self::read_manifest(storage, name)?;
        let bytes = read_all(storage, &items_name(name))?;
        if bytes.len() as u64 != manifest.items_bytes {
            return Err(AnchorageError::storage(format!(
                "item log of {name} is {} bytes, manifest says {}",
                bytes.len(),
                manifest.items_bytes
            )));
        }
        let checksum = crc32fast::hash(&bytes);
        if checksum != manifest.items_checksum {
            return Err(AnchorageError::storage(format!(
                "item log of {name} is corrupt: checksum {checksum:08x}, expected {:08x}",
                manifest.items_checksum
            )));
        }
        let items: Vec<StoredItem> = bincode::deserialize(&bytes)?;
        if items.len() != manifest.item_count {
            return Err(AnchorageError::storage(format!(
                "item log of {name} holds {} items, manifest says {}",
                items.len(),
                manifest.item_count
            )));
        }

        let collection = Collection::new(name, manifest.dimension, manifest.config)?;
        match manifest.anchors {
            Some(anchors) => {
                let items = items
                    .into_iter()
                    .map(|item| (item.id, item.embedding, item.metadata))
                    .collect();
                collection.restore(anchors, items)?;
            }
            None if items.is_empty() => {}
            None => {
                return Err(AnchorageError::storage(format!(
                    "collection {name} has items but no anchor set"
                )));
            }
        }
        info!(
            "loaded collection {name} ({} items, anchor version {})",
            manifest.item_count,
            collection.anchor_version()
        );
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::search::SearchRequest;
    use crate::storage::MemoryStorage;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    fn collection() -> Collection {
        let mut config = EngineConfig::default();
        config.anchors.count = 2;
        let collection = Collection::new("points", 2, config).unwrap();
        let points = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [5.0, 6.0]];
        let sample: Vec<Embedding> = points.iter().map(|p| embedding(p)).collect();
        collection.bootstrap_anchors(&sample).unwrap();
        for (id, e) in sample.into_iter().enumerate() {
            let metadata = ItemMetadata::default().with_attribute("n", id.to_string());
            collection.ingest(id as ItemId, e, metadata).unwrap();
        }
        collection.commit().unwrap();
        collection.delete(1).unwrap();
        collection.commit().unwrap();
        collection
    }

    #[test]
    fn test_save_and_load() {
        let storage = MemoryStorage::new();
        let original = collection();
        let manifest = original.save(&storage).unwrap();
        assert_eq!(manifest.item_count, 4);
        assert_eq!(
            storage.list_files().unwrap(),
            vec!["points.items.bin", "points.manifest.json"]
        );

        let loaded = Collection::load(&storage, "points").unwrap();
        assert_eq!(loaded.dimension(), 2);
        assert_eq!(loaded.anchors(), original.anchors());
        let snapshot = loaded.snapshot().unwrap();
        assert_eq!(snapshot.live_count(), 4);
        assert!(!snapshot.contains(1));
        assert_eq!(
            snapshot.record(3).unwrap().metadata.attribute("n"),
            Some("3")
        );

        let request = SearchRequest::new(embedding(&[4.0, 5.0]), 1);
        assert_eq!(loaded.search(&request).unwrap().ids(), vec![3]);
    }

    #[test]
    fn test_corrupt_item_log_is_rejected() {
        let storage = MemoryStorage::new();
        collection().save(&storage).unwrap();
        let mut bytes = read_all(&storage, "points.items.bin").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut output = storage.create_output("points.items.bin").unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        let err = Collection::load(&storage, "points").unwrap_err();
        assert!(matches!(err, AnchorageError::Storage(_)));
    }

    #[test]
    fn test_stale_manifest_next_to_new_log_is_rejected() {
        let storage = MemoryStorage::new();
        let original = collection();
        original.save(&storage).unwrap();
        let old_manifest = read_all(&storage, "points.manifest.json").unwrap();

        original
            .ingest(9, embedding(&[2.0, 2.0]), ItemMetadata::default())
            .unwrap();
        original.commit().unwrap();
        original.save(&storage).unwrap();

        // As if the second save stopped after renaming the item log.
        let mut output = storage.create_output("points.manifest.json").unwrap();
        output.write_all(&old_manifest).unwrap();
        output.close().unwrap();

        let err = Collection::load(&storage, "points").unwrap_err();
        assert!(matches!(err, AnchorageError::Storage(_)));
    }

    #[test]
    fn test_missing_and_unbootstrapped() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            Collection::load(&storage, "nothing"),
            Err(AnchorageError::NotFound(_))
        ));

        let empty = Collection::new("empty", 3, EngineConfig::default()).unwrap();
        let manifest = empty.save(&storage).unwrap();
        assert!(manifest.anchors.is_none());
        let loaded = Collection::load(&storage, "empty").unwrap();
        assert!(!loaded.is_bootstrapped());
    }
}
