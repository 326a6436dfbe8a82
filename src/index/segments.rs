//! Copy-on-write tables behind [`IndexSnapshot`](super::IndexSnapshot).
//!
//! Slots live in fixed-size chunks shared by `Arc`. Cloning a table copies
//! one pointer per chunk, and a write copies only the chunk it lands in.
//! Id lookup is a sealed map shared by every snapshot since the last
//! rebuild plus a small map of ids appended after it.

use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;

use crate::item::ItemId;

/// Slots per chunk.
pub(crate) const CHUNK_SIZE: usize = 1024;

/// Append-only slot table.
#[derive(Debug, Clone)]
pub(crate) struct SlotTable<T> {
    chunks: Vec<Arc<Vec<T>>>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
        }
    }
}

impl<T: Clone> SlotTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chunks: Vec::with_capacity(capacity.div_ceil(CHUNK_SIZE)),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.chunks
            .get(slot / CHUNK_SIZE)
            .and_then(|chunk| chunk.get(slot % CHUNK_SIZE))
    }

    /// Mutable access, copying the owning chunk if another snapshot shares it.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        let chunk = self.chunks.get_mut(slot / CHUNK_SIZE)?;
        Arc::make_mut(chunk).get_mut(slot % CHUNK_SIZE)
    }

    /// Append a value and return its slot.
    pub fn push(&mut self, value: T) -> usize {
        let slot = self.len;
        match self.chunks.last_mut() {
            Some(chunk) if chunk.len() < CHUNK_SIZE => Arc::make_mut(chunk).push(value),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_SIZE);
                chunk.push(value);
                self.chunks.push(Arc::new(chunk));
            }
        }
        self.len += 1;
        slot
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    /// Whether both tables hold the same allocation for the chunk of `slot`.
    #[cfg(test)]
    pub fn shares_chunk(&self, other: &Self, slot: usize) -> bool {
        let index = slot / CHUNK_SIZE;
        match (self.chunks.get(index), other.chunks.get(index)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Tombstone bits, chunked like [`SlotTable`].
#[derive(Debug, Clone, Default)]
pub(crate) struct TombstoneBits {
    chunks: Vec<Arc<BitVec>>,
    len: usize,
}

impl TombstoneBits {
    pub fn get(&self, slot: usize) -> bool {
        self.chunks
            .get(slot / CHUNK_SIZE)
            .and_then(|bits| bits.get(slot % CHUNK_SIZE))
            .unwrap_or(false)
    }

    /// Set a bit that is already covered by [`push`](Self::push).
    pub fn set(&mut self, slot: usize, value: bool) {
        if slot >= self.len {
            return;
        }
        if let Some(bits) = self.chunks.get_mut(slot / CHUNK_SIZE) {
            Arc::make_mut(bits).set(slot % CHUNK_SIZE, value);
        }
    }

    pub fn push(&mut self, value: bool) {
        match self.chunks.last_mut() {
            Some(bits) if bits.len() < CHUNK_SIZE => Arc::make_mut(bits).push(value),
            _ => {
                let mut bits = BitVec::with_capacity(CHUNK_SIZE);
                bits.push(value);
                self.chunks.push(Arc::new(bits));
            }
        }
        self.len += 1;
    }
}

/// Id -> slot lookup: a sealed map shared across commits plus recent appends.
#[derive(Debug, Clone, Default)]
pub(crate) struct SlotIndex {
    sealed: Arc<AHashMap<ItemId, usize>>,
    recent: AHashMap<ItemId, usize>,
}

impl SlotIndex {
    pub fn sealed(map: AHashMap<ItemId, usize>) -> Self {
        Self {
            sealed: Arc::new(map),
            recent: AHashMap::new(),
        }
    }

    pub fn get(&self, id: ItemId) -> Option<usize> {
        self.sealed
            .get(&id)
            .or_else(|| self.recent.get(&id))
            .copied()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, id: ItemId, slot: usize) {
        self.recent.insert(id, slot);
    }

    #[cfg(test)]
    pub fn shares_sealed(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sealed, &other.sealed)
    }
}
