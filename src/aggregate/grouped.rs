//! Keyed partial aggregation: `group_key -> finalized_statistic`.
//!
//! A [`PartialAggregation`] holds one state per key and can be merged with
//! another partial built over a disjoint partition. [`aggregate_by_key`]
//! splits the rows into one partition per CPU, reduces each on the rayon
//! pool and merges the partials.

use std::borrow::Borrow;
use std::hash::Hash;

use ahash::AHashMap;
use rayon::prelude::*;

use crate::aggregate::{Aggregate, StreamingAggregator};
use crate::error::Result;

/// Per-key partial states for one aggregator.
pub struct PartialAggregation<'a, K, A: StreamingAggregator> {
    aggregator: &'a A,
    groups: AHashMap<K, A::State>,
}

impl<'a, K, A> PartialAggregation<'a, K, A>
where
    K: Eq + Hash,
    A: StreamingAggregator,
{
    pub fn new(aggregator: &'a A) -> Self {
        Self {
            aggregator,
            groups: AHashMap::new(),
        }
    }

    /// Fold one row into its group, creating the group on first sight.
    pub fn accumulate(&mut self, key: K, input: &A::Input) -> Result<()> {
        let state = self
            .groups
            .entry(key)
            .or_insert_with(|| self.aggregator.init());
        self.aggregator.accumulate(state, input)
    }

    /// Merge another partial built by the same aggregator.
    pub fn merge(mut self, other: Self) -> Result<Self> {
        for (key, state) in other.groups {
            let merged = match self.groups.remove(&key) {
                Some(existing) => self.aggregator.merge(existing, state)?,
                None => state,
            };
            self.groups.insert(key, merged);
        }
        Ok(self)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Finalize every group.
    pub fn finalize(self) -> Result<AHashMap<K, Aggregate<A::Output>>> {
        let aggregator = self.aggregator;
        self.groups
            .into_iter()
            .map(|(key, state)| Ok((key, aggregator.finalize(state)?)))
            .collect()
    }
}

/// Aggregate `(key, row)` pairs in parallel and finalize each group.
pub fn aggregate_by_key<K, V, A>(
    aggregator: &A,
    rows: &[(K, V)],
) -> Result<AHashMap<K, Aggregate<A::Output>>>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Borrow<A::Input> + Sync,
    A: StreamingAggregator,
{
    let partitions = num_cpus::get().max(1);
    let chunk_size = rows.len().div_ceil(partitions).max(1);

    let partial = rows
        .par_chunks(chunk_size)
        .map(|chunk| {
            let mut partial = PartialAggregation::new(aggregator);
            for (key, value) in chunk {
                partial.accumulate(key.clone(), value.borrow())?;
            }
            Ok(partial)
        })
        .try_reduce(|| PartialAggregation::new(aggregator), |a, b| a.merge(b))?;

    partial.finalize()
}
