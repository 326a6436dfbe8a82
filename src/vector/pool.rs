//! Dimension-sized scratch buffer pool.
//!
//! Aggregators and the geometric median draw their working vectors from a
//! pool instead of allocating per row. Buffers are handed out zeroed and are
//! returned with [`VectorPool::release`].

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, ensure_dimension};

/// Default number of idle buffers kept per pool.
const DEFAULT_MAX_IDLE: usize = 64;

/// A pool of `f64` buffers of one fixed length.
#[derive(Debug)]
pub struct VectorPool {
    dimension: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<f64>>>,
    allocated: AtomicUsize,
    reused: AtomicUsize,
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created because the pool was empty.
    pub allocated: usize,
    /// Buffers handed out from the idle list.
    pub reused: usize,
    /// Buffers currently idle.
    pub idle: usize,
}

impl VectorPool {
    /// Create a pool of buffers with `dimension` elements.
    pub fn new(dimension: usize) -> Self {
        Self::with_max_idle(dimension, DEFAULT_MAX_IDLE)
    }

    /// Create a pool that keeps at most `max_idle` returned buffers.
    pub fn with_max_idle(dimension: usize, max_idle: usize) -> Self {
        Self {
            dimension,
            max_idle,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Take a zeroed buffer of `dimension` elements.
    pub fn acquire(&self) -> Vec<f64> {
        if let Some(mut buffer) = self.idle.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            buffer.iter_mut().for_each(|v| *v = 0.0);
            return buffer;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        vec![0.0; self.dimension]
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers of the wrong length are rejected so a pool never hands out a
    /// vector of another dimension.
    pub fn release(&self, buffer: Vec<f64>) -> Result<()> {
        ensure_dimension(self.dimension, buffer.len())?;
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buffer);
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}
