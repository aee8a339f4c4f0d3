//! treesync persistence engine
//!
//! This module keeps a reactive state tree in sync with a local snapshot
//! and a remote backend, including:
//! - Spec-driven field renames between local and remote shapes
//! - Per-unit modified markers with last-write-wins merging
//! - Debounced, batched multi-path remote writes
//! - Local snapshots with inline markers
//! - Remote loading with retry and exponential backoff

pub mod batch;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod latch;
pub mod merge;
pub mod mirror;
pub mod modified;
pub mod pending;
pub mod retry;
pub mod snapshot;
pub mod spec;
pub mod state;
pub mod transform;
pub mod walker;

// Re-export main types
pub use batch::{construct_batch, Batch, BatchContext, RemoteWrite, UnitRef};
pub use config::{LocalConfig, PersistConfig, RemoteConfig};
pub use engine::{FlushOutcome, PersistHandle, SyncEngine};
pub use latch::Latch;
pub use merge::{merge_change, merge_snapshot, remote_wins};
pub use pending::PendingTree;
pub use retry::{RetryConfig, RetryExecutor};
pub use spec::{FieldMap, FieldTransform, ModifiedSpec};
pub use state::{SaveState, SessionState};
pub use transform::{to_local_shape, to_remote_shape};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = PersistConfig::default();
        let _retry_config = RetryConfig::default();
        let _state = SessionState::new();
        let _pending = PendingTree::new();
        assert!(ModifiedSpec::default().is_untracked());
    }
}
