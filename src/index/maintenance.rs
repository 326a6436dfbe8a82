//! Background maintenance worker.
//!
//! A [`MaintenanceWorker`] owns one thread that receives rebuild requests
//! over a bounded crossbeam channel and runs them against a weakly held
//! [`HybridIndex`]. When `background_maintenance` is enabled in the index
//! configuration, commits hand rebuilds to the attached worker instead of
//! running them inline.
//!
//! Finished reports go to a bounded queue that keeps only the most recent
//! [`REPORT_CAPACITY`] entries, so a worker nobody polls does not grow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{AnchorageError, Result};
use crate::index::hybrid::HybridIndex;
use crate::index::snapshot::MaintenanceReason;

/// Number of rebuild requests that may be queued at once.
const QUEUE_CAPACITY: usize = 4;

/// Number of unread reports kept; older ones are discarded first.
pub const REPORT_CAPACITY: usize = 16;

/// Work sent to the maintenance thread.
#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceTask {
    Rebuild { reason: MaintenanceReason },
    Shutdown,
}

/// Result of one maintenance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub reason: MaintenanceReason,
    /// Generation published by the rebuild; `None` when it failed.
    pub generation: Option<u64>,
    pub elapsed_ms: f64,
    pub error: Option<String>,
}

/// Counters of a maintenance worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Reports discarded because nobody read them in time.
    pub dropped_reports: u64,
}

/// Runs index rebuilds on a dedicated thread.
#[derive(Debug)]
pub struct MaintenanceWorker {
    sender: Sender<MaintenanceTask>,
    results: Receiver<MaintenanceReport>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<MaintenanceStats>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    index: Weak<HybridIndex>,
}

impl MaintenanceWorker {
    /// Spawn the worker thread and attach it to `index`.
    pub fn start(index: &Arc<HybridIndex>) -> Result<Self> {
        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        let (result_sender, results) = bounded(REPORT_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(RwLock::new(MaintenanceStats::default()));

        let weak = Arc::downgrade(index);
        let handle = {
            let weak = weak.clone();
            let reports = (result_sender, results.clone());
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("anchorage-maintenance".to_string())
                .spawn(move || Self::run(weak, receiver, reports, running, stats))?
        };

        index.attach_maintenance(sender.clone());
        debug!("maintenance worker started");

        Ok(Self {
            sender,
            results,
            running,
            stats,
            handle: Mutex::new(Some(handle)),
            index: weak,
        })
    }

    fn run(
        index: Weak<HybridIndex>,
        receiver: Receiver<MaintenanceTask>,
        reports: (Sender<MaintenanceReport>, Receiver<MaintenanceReport>),
        running: Arc<AtomicBool>,
        stats: Arc<RwLock<MaintenanceStats>>,
    ) {
        for task in receiver.iter() {
            let reason = match task {
                MaintenanceTask::Shutdown => break,
                MaintenanceTask::Rebuild { reason } => reason,
            };
            let Some(index) = index.upgrade() else {
                break;
            };

            let start = Instant::now();
            let outcome = index.run_maintenance(reason);
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            let report = match outcome {
                Ok(generation) => MaintenanceReport {
                    reason,
                    generation: Some(generation),
                    elapsed_ms,
                    error: None,
                },
                Err(e) => {
                    error!("background rebuild ({reason:?}) failed: {e}");
                    MaintenanceReport {
                        reason,
                        generation: None,
                        elapsed_ms,
                        error: Some(e.to_string()),
                    }
                }
            };
            // Counters and the queue change under one lock.
            let mut stats = stats.write();
            if report.error.is_some() {
                stats.failed += 1;
            } else {
                stats.completed += 1;
            }
            Self::publish(&reports, report, &mut stats);
        }
        running.store(false, Ordering::Release);
    }

    /// Push a report, evicting the oldest unread one when the queue is full.
    fn publish(
        (sender, receiver): &(Sender<MaintenanceReport>, Receiver<MaintenanceReport>),
        mut report: MaintenanceReport,
        stats: &mut MaintenanceStats,
    ) {
        loop {
            match sender.try_send(report) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if receiver.try_recv().is_ok() {
                        stats.dropped_reports += 1;
                    }
                    report = rejected;
                }
                // The worker holds a receiver itself, so this cannot happen.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a rebuild.
    pub fn submit(&self, reason: MaintenanceReason) -> Result<()> {
        if !self.is_running() {
            return Err(AnchorageError::index("maintenance worker is not running"));
        }
        self.sender
            .send(MaintenanceTask::Rebuild { reason })
            .map_err(|_| AnchorageError::index("failed to queue maintenance task"))?;
        self.stats.write().submitted += 1;
        Ok(())
    }

    /// Drain finished reports without blocking.
    pub fn results(&self) -> Vec<MaintenanceReport> {
        self.results.try_iter().collect()
    }

    /// Wait up to `timeout` for the next report.
    pub fn wait_for_report(&self, timeout: Duration) -> Option<MaintenanceReport> {
        self.results.recv_timeout(timeout).ok()
    }

    pub fn stats(&self) -> MaintenanceStats {
        self.stats.read().clone()
    }

    /// Detach from the index, stop the thread and wait for it.
    pub fn stop(&self) -> Result<()> {
        if let Some(index) = self.index.upgrade() {
            index.detach_maintenance();
        }
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        // The thread may already have exited on its own.
        let _ = self.sender.send(MaintenanceTask::Shutdown);
        handle
            .join()
            .map_err(|_| AnchorageError::index("maintenance thread panicked"))?;
        self.running.store(false, Ordering::Release);
        debug!("maintenance worker stopped");
        Ok(())
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("failed to stop maintenance worker: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{AnchorSet, ProjectionEngine};
    use crate::config::IndexConfig;
    use crate::item::{IndexEntry, ItemMetadata};
    use crate::vector::{DistanceMetric, Embedding};

    fn index(background: bool) -> Arc<HybridIndex> {
        let anchors = Arc::new(
            AnchorSet::new(
                vec![Embedding::new(vec![0.0, 0.0]).unwrap()],
                DistanceMetric::Euclidean,
            )
            .unwrap(),
        );
        let config = IndexConfig {
            compaction_ratio: 0.2,
            background_maintenance: background,
            ..IndexConfig::default()
        };
        let index = Arc::new(HybridIndex::new(anchors.clone(), config).unwrap());
        for id in 0..10u64 {
            let embedding = Embedding::new(vec![id as f32 + 1.0, 0.0]).unwrap();
            let coordinate = ProjectionEngine::new().project(&embedding, &anchors).unwrap();
            index
                .insert(IndexEntry::new(id, embedding, coordinate, ItemMetadata::default()))
                .unwrap();
        }
        index.commit().unwrap();
        index
    }

    #[test]
    fn test_commit_hands_rebuild_to_worker() {
        let index = index(true);
        let worker = MaintenanceWorker::start(&index).unwrap();

        for id in 0..3 {
            index.delete(id).unwrap();
        }
        let summary = index.commit().unwrap();
        assert_eq!(summary.maintenance, Some(MaintenanceReason::TombstoneRatio));

        let report = worker
            .wait_for_report(Duration::from_secs(10))
            .expect("rebuild report");
        assert_eq!(report.reason, MaintenanceReason::TombstoneRatio);
        assert!(report.error.is_none());
        assert_eq!(index.snapshot().tombstone_count(), 0);
        assert_eq!(index.snapshot().len(), 7);

        worker.stop().unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_manual_submit() {
        let index = index(false);
        let worker = MaintenanceWorker::start(&index).unwrap();
        let before = index.snapshot().generation();
        worker.submit(MaintenanceReason::Manual).unwrap();
        let report = worker.wait_for_report(Duration::from_secs(10)).unwrap();
        assert_eq!(report.generation, Some(before + 1));
        assert_eq!(worker.stats().submitted, 1);
        assert_eq!(worker.stats().completed, 1);
    }

    #[test]
    fn test_unread_reports_are_bounded() {
        let index = index(false);
        let worker = MaintenanceWorker::start(&index).unwrap();
        let runs = REPORT_CAPACITY * 3;
        for _ in 0..runs {
            worker.submit(MaintenanceReason::Manual).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while worker.stats().completed < runs as u64 {
            assert!(Instant::now() < deadline, "rebuilds never finished");
            thread::sleep(Duration::from_millis(5));
        }

        let stats = worker.stats();
        assert_eq!(stats.dropped_reports, (runs - REPORT_CAPACITY) as u64);
        let reports = worker.results();
        assert_eq!(reports.len(), REPORT_CAPACITY);
        // The newest reports survive.
        assert_eq!(
            reports.last().and_then(|r| r.generation),
            Some(index.snapshot().generation())
        );
        worker.stop().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let index = index(true);
        let worker = MaintenanceWorker::start(&index).unwrap();
        worker.stop().unwrap();
        worker.stop().unwrap();
        assert!(worker.submit(MaintenanceReason::Manual).is_err());
    }
}
