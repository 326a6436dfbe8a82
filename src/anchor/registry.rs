//! The current anchor set of a collection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::set::AnchorSet;
use crate::error::{AnchorageError, Result};

/// Record of one installed anchor set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRevision {
    pub id: Uuid,
    pub version: u64,
    pub anchors: usize,
    pub reduced_fidelity: bool,
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    current: Option<Arc<AnchorSet>>,
    history: Vec<AnchorRevision>,
}

/// Holds the current [`AnchorSet`] and assigns monotonically increasing
/// versions to newly installed sets.
///
/// Callers that must not observe a half-finished migration (re-projection of
/// the index) serialize on the collection's migration lock; the registry
/// itself only guarantees that `current` is swapped atomically.
#[derive(Debug, Default)]
pub struct AnchorRegistry {
    state: RwLock<RegistryState>,
}

impl AnchorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current anchor set, if any has been installed.
    pub fn current(&self) -> Option<Arc<AnchorSet>> {
        self.state.read().current.clone()
    }

    /// The current anchor set, or a `NotFound` error.
    pub fn require_current(&self) -> Result<Arc<AnchorSet>> {
        self.current()
            .ok_or_else(|| AnchorageError::not_found("no anchor set installed"))
    }

    /// Version of the current set; 0 when none is installed.
    pub fn version(&self) -> u64 {
        self.state
            .read()
            .current
            .as_ref()
            .map(|set| set.version())
            .unwrap_or(0)
    }

    /// Install `set` as the next version and return it.
    pub fn install(&self, set: AnchorSet) -> Arc<AnchorSet> {
        let mut state = self.state.write();
        let version = state
            .current
            .as_ref()
            .map(|current| current.version() + 1)
            .unwrap_or(1);
        let installed = Arc::new(set.with_version(version));
        info!(
            "installed anchor set {} as version {} ({} anchors)",
            installed.id(),
            version,
            installed.len()
        );
        state.history.push(revision(&installed));
        state.current = Some(installed.clone());
        installed
    }

    /// Put back a persisted set with its recorded version.
    pub fn restore(&self, set: AnchorSet) -> Result<Arc<AnchorSet>> {
        let mut state = self.state.write();
        if let Some(current) = &state.current
            && current.version() >= set.version()
        {
            return Err(AnchorageError::invalid_argument(format!(
                "cannot restore anchor version {} over version {}",
                set.version(),
                current.version()
            )));
        }
        let restored = Arc::new(set);
        state.history.push(revision(&restored));
        state.current = Some(restored.clone());
        Ok(restored)
    }

    /// Every set installed so far, oldest first.
    pub fn history(&self) -> Vec<AnchorRevision> {
        self.state.read().history.clone()
    }
}

fn revision(set: &AnchorSet) -> AnchorRevision {
    AnchorRevision {
        id: set.id(),
        version: set.version(),
        anchors: set.len(),
        reduced_fidelity: set.reduced_fidelity(),
        installed_at: Utc::now(),
    }
}
