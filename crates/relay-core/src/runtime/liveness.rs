//! Process-local worker liveness registry.
//!
//! Every runtime worker registers its execution id for the duration of the
//! run; the recovery sweeper asks this registry (rather than inspecting
//! threads) to decide whether an active execution row still has an owner.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Tracks which execution ids currently have a live worker in this process.
#[derive(Clone, Default)]
pub struct LivenessRegistry {
    inner: Arc<Mutex<HashSet<i64>>>,
}

impl LivenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for `execution_id`. The returned guard deregisters
    /// on drop, so a panicking or cancelled worker still cleans up.
    pub fn register(&self, execution_id: i64) -> LivenessGuard {
        self.inner
            .lock()
            .expect("liveness registry poisoned")
            .insert(execution_id);
        LivenessGuard {
            registry: self.clone(),
            execution_id,
        }
    }

    /// Is there a live worker for this execution?
    pub fn is_alive(&self, execution_id: i64) -> bool {
        self.inner
            .lock()
            .expect("liveness registry poisoned")
            .contains(&execution_id)
    }

    /// Execution ids with live workers, in no particular order.
    pub fn active(&self) -> Vec<i64> {
        self.inner
            .lock()
            .expect("liveness registry poisoned")
            .iter()
            .copied()
            .collect()
    }
}

impl std::fmt::Debug for LivenessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessRegistry")
            .field("active", &self.active())
            .finish()
    }
}

/// RAII handle for a registered worker.
pub struct LivenessGuard {
    registry: LivenessRegistry,
    execution_id: i64,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.registry
            .inner
            .lock()
            .expect("liveness registry poisoned")
            .remove(&self.execution_id);
    }
}
