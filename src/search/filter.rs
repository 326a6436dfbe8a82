//! Metadata predicates applied as candidate filters in every funnel stage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::ItemMetadata;

/// Conjunction of simple metadata conditions. An empty filter accepts
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataFilter {
    /// Attributes that must be present with exactly these values.
    pub equals: HashMap<String, String>,
    pub min_importance: Option<f32>,
    /// Inclusive lower bound on the item timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the item timestamp.
    pub until: Option<DateTime<Utc>>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn with_min_importance(mut self, importance: f32) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn with_time_range(
        mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
            && self.min_importance.is_none()
            && self.since.is_none()
            && self.until.is_none()
    }

    pub fn matches(&self, metadata: &ItemMetadata) -> bool {
        if let Some(min) = self.min_importance
            && metadata.importance < min
        {
            return false;
        }
        if let Some(since) = self.since
            && metadata.timestamp < since
        {
            return false;
        }
        if let Some(until) = self.until
            && metadata.timestamp >= until
        {
            return false;
        }
        self.equals
            .iter()
            .all(|(key, value)| metadata.attribute(key) == Some(value.as_str()))
    }
}
