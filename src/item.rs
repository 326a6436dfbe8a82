//! Items: the atomic content units stored in a collection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anchor::ProjectedCoordinate;
use crate::vector::Embedding;

/// Stable identifier of an item within a collection.
pub type ItemId = u64;

/// Metadata attached to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Caller-assigned relevance score.
    pub importance: f32,
    pub timestamp: DateTime<Utc>,
    /// Number of live references. The item is tombstoned when this drops to zero.
    pub reference_count: u32,
    /// Free-form attributes matched by metadata filters.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Default for ItemMetadata {
    fn default() -> Self {
        Self {
            importance: 0.0,
            timestamp: Utc::now(),
            reference_count: 1,
            attributes: HashMap::new(),
        }
    }
}

impl ItemMetadata {
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// An item ready to be inserted into a [`HybridIndex`](crate::index::HybridIndex).
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: ItemId,
    pub embedding: Embedding,
    pub coordinate: ProjectedCoordinate,
    pub metadata: ItemMetadata,
}

impl IndexEntry {
    pub fn new(
        id: ItemId,
        embedding: Embedding,
        coordinate: ProjectedCoordinate,
        metadata: ItemMetadata,
    ) -> Self {
        Self {
            id,
            embedding,
            coordinate,
            metadata,
        }
    }
}
