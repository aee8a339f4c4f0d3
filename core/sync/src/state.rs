//! Persistence session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Save state of the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaveState {
    /// Nothing pending.
    Idle,
    /// Local changes waiting for the debounce to elapse.
    Dirty,
    /// A remote write is in flight.
    Flushing,
}

/// Snapshot of a persistence session, as reported by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub save_state: SaveState,
    /// The local snapshot has been restored.
    pub loaded_local: bool,
    /// The first remote snapshot has been merged.
    pub loaded_remote: bool,
    /// Number of acknowledged remote writes.
    pub flush_count: u64,
    /// Consecutive failed remote writes.
    pub failure_count: u32,
    /// Last error message if failed.
    pub last_error: Option<String>,
    /// Last acknowledged remote write.
    pub last_flush: Option<DateTime<Utc>>,
    /// Pending replacements not yet handed to the remote.
    pub pending_entries: usize,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            save_state: SaveState::Idle,
            loaded_local: false,
            loaded_remote: false,
            flush_count: 0,
            failure_count: 0,
            last_error: None,
            last_flush: None,
            pending_entries: 0,
        }
    }

    /// Mark local changes as waiting.
    pub fn mark_dirty(&mut self) {
        if self.save_state == SaveState::Idle {
            self.save_state = SaveState::Dirty;
        }
    }

    /// Mark a remote write as started.
    pub fn mark_flushing(&mut self) {
        self.save_state = SaveState::Flushing;
    }

    /// Mark the in-flight write as acknowledged.
    ///
    /// `still_pending` tells whether changes arrived during the write.
    pub fn mark_flushed(&mut self, still_pending: bool) {
        self.save_state = if still_pending {
            SaveState::Dirty
        } else {
            SaveState::Idle
        };
        self.flush_count += 1;
        self.failure_count = 0;
        self.last_error = None;
        self.last_flush = Some(Utc::now());
    }

    /// Mark the in-flight write as failed; its entries stay pending.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.save_state = SaveState::Dirty;
        self.failure_count += 1;
        self.last_error = Some(error.into());
    }

    /// Whether the session holds changes the remote has not acknowledged.
    pub fn has_pending_changes(&self) -> bool {
        self.save_state != SaveState::Idle
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
