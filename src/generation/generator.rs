//! Retrieval-driven generation loop.
//!
//! Each step encodes the sliding window into a query, runs the funnel,
//! samples one hit with the attention sampler and appends it to the window.
//! The window holds at most `window_size` items; the oldest drop out first.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::attention::{AttentionResult, AttentionSampler};
use crate::collection::Collection;
use crate::config::GenerationConfig;
use crate::error::{AnchorageError, Result};
use crate::generation::encoder::{CentroidContextEncoder, ContextEncoder};
use crate::item::ItemId;
use crate::search::{SearchHit, SearchRequest, SearchStatus};
use crate::vector::Embedding;

/// Record of one generation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStep {
    pub step: usize,
    pub id: ItemId,
    pub distance: f32,
    pub weight: f64,
    /// Hits the sampler chose from.
    pub candidates: usize,
    pub search_status: SearchStatus,
}

#[derive(Debug)]
pub struct Generator {
    collection: Arc<Collection>,
    encoder: Box<dyn ContextEncoder>,
    sampler: AttentionSampler,
    config: GenerationConfig,
    window: VecDeque<(Option<ItemId>, Embedding)>,
    steps: usize,
}

impl Generator {
    /// A generator with the centroid encoder and the collection's sampler.
    pub fn new(collection: Arc<Collection>) -> Self {
        let config = collection.config().generation.clone();
        let sampler = collection.sampler().clone();
        Self {
            collection,
            encoder: Box::new(CentroidContextEncoder),
            sampler,
            config,
            window: VecDeque::new(),
            steps: 0,
        }
    }

    pub fn with_encoder<E: ContextEncoder + 'static>(mut self, encoder: E) -> Self {
        self.encoder = Box::new(encoder);
        self
    }

    pub fn with_sampler(mut self, sampler: AttentionSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Result<Self> {
        if config.window_size == 0 || config.candidates_per_step == 0 {
            return Err(AnchorageError::invalid_config(
                "generation window and candidate count must be positive",
            ));
        }
        self.config = config;
        self.trim();
        Ok(self)
    }

    /// Push free-standing context (a prompt) into the window.
    pub fn prime<I: IntoIterator<Item = Embedding>>(&mut self, context: I) -> Result<()> {
        for embedding in context {
            embedding.ensure_dimension(self.collection.dimension())?;
            self.push(None, embedding);
        }
        Ok(())
    }

    /// Items generated so far that are still in the window, oldest first.
    pub fn window_ids(&self) -> Vec<ItemId> {
        self.window.iter().filter_map(|(id, _)| *id).collect()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.steps = 0;
    }

    fn push(&mut self, id: Option<ItemId>, embedding: Embedding) {
        self.window.push_back((id, embedding));
        self.trim();
    }

    fn trim(&mut self) {
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
    }

    /// Run one step. `None` when no candidate is left to choose.
    pub fn step(&mut self) -> Result<Option<GenerationStep>> {
        let window: Vec<Embedding> = self.window.iter().map(|(_, e)| e.clone()).collect();
        let query = self
            .encoder
            .encode(&window)?
            .ok_or_else(|| AnchorageError::invalid_argument("context window is empty"))?;

        let in_window = self.window_ids();
        // Ask for enough hits that excluded window items cannot starve the step.
        let k = if self.config.avoid_repeats {
            self.config.candidates_per_step + in_window.len()
        } else {
            self.config.candidates_per_step
        };
        let request = SearchRequest::new(query, k).with_embeddings(true);
        let results = self.collection.search(&request)?;

        let hits: Vec<SearchHit> = results
            .hits
            .into_iter()
            .filter(|hit| !(self.config.avoid_repeats && in_window.contains(&hit.id)))
            .take(self.config.candidates_per_step)
            .collect();

        let output = match self.sampler.sample_hits(&hits)? {
            AttentionResult::Selected(output) => output,
            AttentionResult::NoCandidates => return Ok(None),
        };
        let Some(selected) = output.selections.first().copied() else {
            return Ok(None);
        };
        let hit = &hits[selected.rank];
        let embedding = hit.embedding.clone().ok_or_else(|| {
            AnchorageError::index(format!("hit {} came back without its embedding", hit.id))
        })?;

        self.steps += 1;
        let step = GenerationStep {
            step: self.steps,
            id: hit.id,
            distance: hit.distance,
            weight: selected.weight,
            candidates: hits.len(),
            search_status: results.status,
        };
        debug!(
            "generation step {}: selected {} at distance {:.4} from {} candidates",
            step.step, step.id, step.distance, step.candidates
        );
        self.push(Some(hit.id), embedding);
        Ok(Some(step))
    }

    /// Run up to `steps` steps, stopping early when candidates run out.
    pub fn generate(&mut self, steps: usize) -> Result<Vec<GenerationStep>> {
        let mut produced = Vec::with_capacity(steps);
        for _ in 0..steps {
            match self.step()? {
                Some(step) => produced.push(step),
                None => break,
            }
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::item::ItemMetadata;

    fn collection() -> Arc<Collection> {
        let collection = Collection::new("line", 2, EngineConfig::default()).unwrap();
        let points: Vec<Embedding> = (0..10)
            .map(|i| Embedding::new(vec![i as f32, 0.0]).unwrap())
            .collect();
        collection.bootstrap_anchors(&points).unwrap();
        for (id, e) in points.into_iter().enumerate() {
            collection.ingest(id as ItemId, e, ItemMetadata::default()).unwrap();
        }
        collection.commit().unwrap();
        Arc::new(collection)
    }

    #[test]
    fn test_generation_walks_without_repeats() {
        let mut generator = Generator::new(collection());
        generator.prime([Embedding::new(vec![0.2, 0.0]).unwrap()]).unwrap();

        let steps = generator.generate(3).unwrap();
        let ids: Vec<ItemId> = steps.iter().map(|s| s.id).collect();
        // Argmax walks outwards from the prompt: 0, then the centroid of
        // {0.2, 0} is 0.1 so 1 is nearest, and so on.
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(generator.window_ids(), vec![0, 1, 2]);
        assert_eq!(generator.steps(), 3);
        assert!(steps.iter().all(|s| s.search_status == SearchStatus::Complete));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut generator = Generator::new(collection())
            .with_config(GenerationConfig {
                window_size: 2,
                candidates_per_step: 4,
                avoid_repeats: true,
            })
            .unwrap();
        generator.prime([Embedding::new(vec![0.0, 0.0]).unwrap()]).unwrap();
        generator.generate(5).unwrap();
        assert_eq!(generator.window_len(), 2);
        assert_eq!(generator.window_ids().len(), 2);
    }

    #[test]
    fn test_runs_out_of_candidates() {
        let mut generator = Generator::new(collection());
        generator.prime([Embedding::new(vec![0.0, 0.0]).unwrap()]).unwrap();
        let steps = generator.generate(20).unwrap();
        assert_eq!(steps.len(), 10);
        assert!(generator.step().unwrap().is_none());
    }

    #[test]
    fn test_errors() {
        let mut generator = Generator::new(collection());
        assert!(generator.step().is_err());
        assert!(generator.prime([Embedding::new(vec![1.0]).unwrap()]).is_err());
        assert!(
            Generator::new(collection())
                .with_config(GenerationConfig {
                    window_size: 0,
                    ..GenerationConfig::default()
                })
                .is_err()
        );
    }
}
