//! In-memory state container.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::trace;

use treesync_common::tree::{get_at, set_at};
use treesync_common::{Marker, StatePath};

use crate::store::{Change, ChangeCallback, ChangeKind, Origin, StateStore, Subscription};

struct Listener {
    id: u64,
    path: StatePath,
    callback: ChangeCallback,
}

struct Inner {
    root: Value,
    markers: BTreeMap<StatePath, Marker>,
    listeners: Vec<Listener>,
    next_listener: u64,
}

/// In-memory reactive state tree.
///
/// Listeners run synchronously on the writing thread, after the write lock
/// has been released, so a listener may read the store.
#[derive(Clone)]
pub struct MemoryState {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryState {
    /// Create a store holding `initial` as its root value.
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                root: initial,
                markers: BTreeMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
            })),
        }
    }

    /// Clone of the whole tree.
    pub fn snapshot(&self) -> Value {
        self.read().root.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: Change) {
        let callbacks: Vec<ChangeCallback> = self
            .read()
            .listeners
            .iter()
            .filter(|l| l.path.overlaps(&change.path))
            .map(|l| l.callback.clone())
            .collect();

        trace!(
            "Change at {} ({:?}, {:?}) to {} listeners",
            change.path,
            change.kind,
            change.origin,
            callbacks.len()
        );
        for callback in callbacks {
            callback(&change);
        }
    }
}

impl Default for MemoryState {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl StateStore for MemoryState {
    fn get(&self, path: &StatePath) -> Option<Value> {
        get_at(&self.read().root, path).cloned()
    }

    fn set(&self, path: &StatePath, value: Value, origin: Origin) {
        {
            let mut inner = self.write();
            let current = get_at(&inner.root, path).unwrap_or(&Value::Null);
            if *current == value {
                return;
            }
            set_at(&mut inner.root, path, value.clone());
        }

        self.notify(Change {
            path: path.clone(),
            value,
            kind: ChangeKind::Set,
            origin,
        });
    }

    fn assign(&self, path: &StatePath, fields: Map<String, Value>, origin: Origin) {
        let mut changed = Map::new();
        {
            let mut inner = self.write();
            for (key, value) in fields {
                let field_path = path.child(&key);
                let current = get_at(&inner.root, &field_path).unwrap_or(&Value::Null);
                if *current != value {
                    set_at(&mut inner.root, &field_path, value.clone());
                    changed.insert(key, value);
                }
            }
        }

        if changed.is_empty() {
            return;
        }
        self.notify(Change {
            path: path.clone(),
            value: Value::Object(changed),
            kind: ChangeKind::Assign,
            origin,
        });
    }

    fn on_change(&self, path: &StatePath, callback: ChangeCallback) -> Subscription {
        let id = {
            let mut inner = self.write();
            let id = inner.next_listener;
            inner.next_listener += 1;
            inner.listeners.push(Listener {
                id,
                path: path.clone(),
                callback,
            });
            id
        };

        let weak: Weak<RwLock<Inner>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .retain(|l| l.id != id);
            }
        })
    }

    fn get_modified(&self, path: &StatePath) -> Option<Marker> {
        self.read().markers.get(path).copied()
    }

    fn set_modified(&self, path: &StatePath, marker: Option<Marker>) {
        let mut inner = self.write();
        match marker {
            Some(marker) => {
                inner.markers.insert(path.clone(), marker);
            }
            None => {
                inner.markers.remove(path);
            }
        }
    }

    fn modified_under(&self, path: &StatePath) -> BTreeMap<StatePath, Marker> {
        self.read()
            .markers
            .range(path.clone()..)
            .take_while(|(p, _)| p.starts_with(path))
            .map(|(p, m)| (p.clone(), *m))
            .collect()
    }
}
