//! State container trait definition.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use treesync_common::{Marker, StatePath};

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Application code.
    Local,
    /// A merge of remote data.
    Remote,
    /// Restoring a local snapshot.
    Persist,
}

/// Shape of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The whole subtree at the path was replaced.
    Set,
    /// Only the listed fields of the object at the path were written.
    Assign,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Path that was written.
    pub path: StatePath,
    /// New value for `Set` (`null` on delete), or the written fields for `Assign`.
    pub value: Value,
    pub kind: ChangeKind,
    pub origin: Origin,
}

/// Listener invoked synchronously after each change.
pub type ChangeCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Reactive state container.
///
/// Implementations store a JSON-shaped tree plus out-of-band modified
/// markers, and notify listeners whose path overlaps a changed path.
/// Writes that leave the tree unchanged must not notify.
pub trait StateStore: Send + Sync {
    /// Get the value at a path.
    fn get(&self, path: &StatePath) -> Option<Value>;

    /// Replace the subtree at a path. `null` deletes it.
    fn set(&self, path: &StatePath, value: Value, origin: Origin);

    /// Write individual fields of the object at a path, leaving its other
    /// fields untouched.
    fn assign(&self, path: &StatePath, fields: Map<String, Value>, origin: Origin);

    /// Subscribe to changes overlapping `path`.
    ///
    /// The subscription is removed when the returned handle is dropped.
    fn on_change(&self, path: &StatePath, callback: ChangeCallback) -> Subscription;

    /// Modified marker of the node at a path.
    fn get_modified(&self, path: &StatePath) -> Option<Marker>;

    /// Set or clear the modified marker of the node at a path.
    fn set_modified(&self, path: &StatePath, marker: Option<Marker>);

    /// All markers at or below `path`, keyed by absolute path.
    fn modified_under(&self, path: &StatePath) -> BTreeMap<StatePath, Marker>;
}

/// Handle that unsubscribes when dropped.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription running `unsubscribe` on drop.
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
