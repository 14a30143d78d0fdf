//! Single-slot cancellable refresh timer
//!
//! At most one proactive refresh task is outstanding. Each task is tagged
//! with the credential generation it was armed for; arming a new task aborts
//! the previous one, and a firing task must `release` its slot before doing
//! any work. A task whose generation no longer owns the slot is stale and
//! does nothing.

use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::debug;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Holds the one outstanding refresh task, if any.
#[derive(Default)]
pub struct RefreshTimer {
    slot: Mutex<Option<ArmedTimer>>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outstanding task with the one produced by `spawn`.
    ///
    /// The slot stays locked while `spawn` runs, so the new task cannot
    /// observe the slot before its own handle is stored.
    pub fn arm(&self, generation: u64, spawn: impl FnOnce() -> JoinHandle<()>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            debug!(
                generation = previous.generation,
                "cancelling superseded refresh timer"
            );
            previous.handle.abort();
        }
        *slot = Some(ArmedTimer {
            generation,
            handle: spawn(),
        });
    }

    /// Abort the outstanding task, if any.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
    }

    /// Called by a firing task. Detaches the task from the slot (without
    /// aborting it) and returns true if it is still the current one.
    pub fn release(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(armed) if armed.generation == generation => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    /// Generation of the outstanding task.
    pub fn armed_generation(&self) -> Option<u64> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|armed| armed.generation)
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
