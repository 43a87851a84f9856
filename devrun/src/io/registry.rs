//! In-process registry of runs that currently have an active processing loop.
//!
//! This is advisory mutual exclusion for a single process. It does not
//! survive a restart and does not coordinate between processes; a distributed
//! deployment needs a durable lease (owner id, expiry, heartbeat) instead.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `run_id`. Returns `None` if another loop already holds it.
    ///
    /// The claim is released when the guard drops, including during unwinding.
    pub fn try_mark_active(&self, run_id: &str) -> Option<ActiveRunGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(run_id.to_string()) {
            debug!(run_id, "run already active");
            return None;
        }
        debug!(run_id, "run marked active");
        Some(ActiveRunGuard {
            registry: self.clone(),
            run_id: run_id.to_string(),
        })
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(run_id)
    }

    fn release(&self, run_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        debug!(run_id, "run released");
    }
}

/// Holds a run's slot in the [`WorkerRegistry`].
#[derive(Debug)]
pub struct ActiveRunGuard {
    registry: WorkerRegistry,
    run_id: String,
}

impl ActiveRunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.registry.release(&self.run_id);
    }
}
