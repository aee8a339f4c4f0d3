//! Remote mirror: best-known remote-shaped data below the sync root.

use serde_json::Value;

use treesync_common::tree::{get_at, resolve_sentinels, set_at};
use treesync_common::StatePath;
use treesync_storage::Delta;

use crate::batch::RemoteWrite;
use crate::modified::marker_path_for;

#[derive(Debug, Clone, Default)]
pub struct Mirror {
    root: Value,
    loaded: bool,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mirror with a freshly loaded snapshot.
    pub fn load(&mut self, snapshot: Value) {
        self.root = snapshot;
        self.loaded = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &StatePath) -> Option<&Value> {
        get_at(&self.root, path)
    }

    /// Apply a pushed change.
    pub fn apply_delta(&mut self, delta: &Delta) {
        set_at(&mut self.root, &delta.path, delta.value.clone());
    }

    /// Apply acknowledged writes, stamping sentinels with `timestamp`.
    pub fn apply_writes(&mut self, writes: &[RemoteWrite], timestamp: i64) {
        for write in writes {
            let path = if write.marker {
                marker_path_for(&write.path)
            } else {
                write.path.clone()
            };
            let mut value = write.value.clone();
            resolve_sentinels(&mut value, timestamp);
            set_at(&mut self.root, &path, value);
        }
    }
}
