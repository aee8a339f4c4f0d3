//! Remote load and merge with last-write-wins per tracked unit.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

use treesync_common::{Marker, StatePath, MARKER_KEY};
use treesync_state::{Origin, StateStore};

use crate::mirror::Mirror;
use crate::modified::{extract_incoming, lift_markers, Tracking};
use crate::spec::{FieldTransform, ModifiedSpec};
use crate::transform::to_local_shape;
use crate::walker::{walk, Visitor};

/// Last-write-wins: whether the remote copy of a unit replaces the local
/// one.
///
/// The remote wins when the unit has no local marker, or when its marker
/// is at least as new as the local one. A missing remote marker loses to
/// any local marker.
pub fn remote_wins(local: Option<Marker>, remote: Option<Marker>) -> bool {
    match (local, remote) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(local), Some(remote)) => remote >= local,
    }
}

/// Paths whose local writes are pending or in flight; untracked remote
/// data never overwrites them.
pub type Guard<'a> = &'a dyn Fn(&StatePath) -> bool;

/// Where a remote change lands locally.
#[derive(Debug, Clone)]
pub struct MergeTarget<'a> {
    pub local: StatePath,
    /// Remote path relative to the sync root.
    pub remote: StatePath,
    pub tracking: Tracking<'a>,
    pub transform: Option<&'a FieldTransform>,
}

/// Resolve the merge root for a change at `remote_path`.
///
/// The walk stops at the enclosing tracked unit, so a change inside a
/// unit re-merges the unit as a whole. A change to a marker (`.../@`)
/// re-merges the node it belongs to.
pub fn locate<'a>(
    modified: &'a ModifiedSpec,
    transform: &'a FieldTransform,
    remote_path: &StatePath,
) -> MergeTarget<'a> {
    let mut target = MergeTarget {
        local: StatePath::root(),
        remote: StatePath::root(),
        tracking: Tracking::Spec(modified),
        transform: Some(transform),
    };

    for segment in remote_path.segments() {
        if segment == MARKER_KEY || target.tracking == Tracking::Unit {
            break;
        }
        let (local_key, next) = match target.transform {
            Some(transform) => transform.incoming_child(segment),
            None => (segment.clone(), None),
        };
        target.tracking = target.tracking.descend(&local_key);
        target.local = target.local.child(&local_key);
        target.remote = target.remote.child(segment);
        target.transform = next;
    }
    target
}

/// Merges local-shaped remote data into a state container.
pub struct Merger<'a> {
    state: &'a dyn StateStore,
    guard: Guard<'a>,
    changes: usize,
}

impl<'a> Merger<'a> {
    pub fn new(state: &'a dyn StateStore, guard: Guard<'a>) -> Self {
        Self {
            state,
            guard,
            changes: 0,
        }
    }

    /// Number of values and markers written so far.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Merge `remote` (local shape, markers inline) at `path`.
    pub fn merge(&mut self, path: &StatePath, tracking: Tracking<'_>, remote: Value) {
        match tracking {
            Tracking::Unit | Tracking::InsideUnit => self.merge_unit(path, remote),
            Tracking::Untracked => self.merge_untracked(path, remote),
            Tracking::Spec(spec) => {
                let mut descend = Descend {
                    merger: self,
                    base: path.clone(),
                    spec,
                };
                walk(spec, path, remote, &mut descend);
            }
        }
    }

    /// Local children of `path`, each mapped to `null`.
    fn deleted_children(&self, path: &StatePath) -> Value {
        let children: Map<String, Value> = match self.state.get(path) {
            Some(Value::Object(local)) => local.keys().map(|k| (k.clone(), Value::Null)).collect(),
            _ => Map::new(),
        };
        Value::Object(children)
    }

    fn merge_unit(&mut self, path: &StatePath, remote: Value) {
        let (marker, value, markers) = extract_incoming(path, remote);
        let local = self.state.get_modified(path);
        if !remote_wins(local, marker) {
            debug!(
                "Keeping local {} (local {:?} newer than remote {:?})",
                path, local, marker
            );
            return;
        }

        if self.state.get(path).unwrap_or(Value::Null) != value {
            trace!("Remote wins at {}", path);
            self.state.set(path, value, Origin::Remote);
            self.changes += 1;
        }

        let incoming: BTreeSet<&StatePath> = markers.iter().map(|(p, _)| p).collect();
        for stale in self.state.modified_under(path).into_keys() {
            if !incoming.contains(&stale) {
                self.state.set_modified(&stale, None);
                self.changes += 1;
            }
        }
        for (marker_path, marker) in &markers {
            if self.state.get_modified(marker_path) != Some(*marker) {
                self.state.set_modified(marker_path, Some(*marker));
                self.changes += 1;
            }
        }
    }

    fn merge_untracked(&mut self, path: &StatePath, remote: Value) {
        let mut markers = Vec::new();
        let value = lift_markers(remote, path, &mut markers);
        let local = self.state.get(path);
        self.overwrite(path, local.as_ref(), value);

        for (marker_path, marker) in markers {
            if (self.guard)(&marker_path) {
                continue;
            }
            if self.state.get_modified(&marker_path) != Some(marker) {
                self.state.set_modified(&marker_path, Some(marker));
                self.changes += 1;
            }
        }
    }

    fn overwrite(&mut self, path: &StatePath, local: Option<&Value>, remote: Value) {
        match (local, remote) {
            (Some(Value::Object(local_map)), Value::Object(remote_map)) => {
                for (key, child) in remote_map {
                    self.overwrite(&path.child(&key), local_map.get(&key), child);
                }
            }
            (local, remote) => {
                let unchanged = match local {
                    Some(local) => *local == remote,
                    None => remote.is_null(),
                };
                if unchanged {
                    return;
                }
                if (self.guard)(path) {
                    debug!("Skipping remote value at {}: local write pending", path);
                    return;
                }
                self.state.set(path, remote, Origin::Remote);
                self.changes += 1;
            }
        }
    }

    fn lift_node_marker(&mut self, path: &StatePath, raw: &Value) {
        let Some(marker) = Marker::from_value(raw) else {
            warn!("Ignoring malformed marker at {}: {}", path, raw);
            return;
        };
        if (self.guard)(path) {
            return;
        }
        if self.state.get_modified(path) != Some(marker) {
            self.state.set_modified(path, Some(marker));
            self.changes += 1;
        }
    }
}

/// Walks interior spec nodes on behalf of a [`Merger`].
struct Descend<'m, 'a, 's> {
    merger: &'m mut Merger<'a>,
    base: StatePath,
    spec: &'s ModifiedSpec,
}

impl Visitor for Descend<'_, '_, '_> {
    type Output = ();

    fn unit(&mut self, path: &StatePath, value: Value) {
        self.merger.merge_unit(path, value);
    }

    fn unmapped(&mut self, path: &StatePath, value: Value) {
        self.merger.merge_untracked(path, value);
    }

    fn leaf(&mut self, path: &StatePath, value: Value) {
        if !value.is_null() {
            self.merger.merge_untracked(path, value);
            return;
        }

        // Deleted remotely: each local unit below decides on its own
        let relative = path.strip_prefix(&self.base).unwrap_or_else(StatePath::root);
        match Tracking::Spec(self.spec).at(&relative) {
            Tracking::Spec(spec) => {
                let children = self.merger.deleted_children(path);
                walk(spec, path, children, self);
            }
            tracking => self.merger.merge(path, tracking, Value::Null),
        }
    }

    fn node(&mut self, path: &StatePath, marker: Option<Value>, _children: Vec<(String, ())>) {
        if let Some(raw) = marker {
            self.merger.lift_node_marker(path, &raw);
        }
    }
}

/// Merge a full remote snapshot (remote shape) into `state`.
///
/// Returns the number of values and markers written. A `null` snapshot
/// merges nothing.
pub fn merge_snapshot(
    state: &dyn StateStore,
    modified: &ModifiedSpec,
    transform: &FieldTransform,
    snapshot: Value,
    guard: Guard<'_>,
) -> usize {
    if snapshot.is_null() {
        return 0;
    }
    let local = to_local_shape(snapshot, transform);
    let mut merger = Merger::new(state, guard);
    merger.merge(&StatePath::root(), Tracking::Spec(modified), local);
    merger.changes()
}

/// Re-merge the part of the mirror affected by a change at `remote_path`.
///
/// The mirror must already include the change.
pub fn merge_change(
    state: &dyn StateStore,
    modified: &ModifiedSpec,
    transform: &FieldTransform,
    mirror: &Mirror,
    remote_path: &StatePath,
    guard: Guard<'_>,
) -> usize {
    let target = locate(modified, transform, remote_path);
    let remote = mirror.get(&target.remote).cloned().unwrap_or(Value::Null);
    let local = match target.transform {
        Some(transform) => to_local_shape(remote, transform),
        None => remote,
    };

    debug!(
        "Merging remote change at {} into {}",
        target.remote, target.local
    );
    let mut merger = Merger::new(state, guard);
    merger.merge(&target.local, target.tracking, local);
    merger.changes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::FieldMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use treesync_state::{Change, MemoryState};

    fn path(s: &str) -> StatePath {
        StatePath::parse(s).unwrap()
    }

    fn no_guard(_: &StatePath) -> bool {
        false
    }

    fn modified(raw: Value) -> ModifiedSpec {
        ModifiedSpec::parse(&raw).unwrap()
    }

    fn identity() -> FieldTransform {
        FieldTransform::default()
    }

    #[test]
    fn test_remote_wins_rule() {
        assert!(remote_wins(None, None));
        assert!(remote_wins(None, Some(Marker::At(1))));
        assert!(!remote_wins(Some(Marker::At(1)), None));
        assert!(remote_wins(Some(Marker::At(1000)), Some(Marker::At(1000))));
        assert!(!remote_wins(Some(Marker::At(1001)), Some(Marker::At(1000))));
        assert!(!remote_wins(Some(Marker::Pending), Some(Marker::At(i64::MAX))));
    }

    #[test]
    fn test_primitive_unit_merges_value_and_marker() {
        let state = MemoryState::new(json!({"test": {"test2": "", "test3": ""}}));
        let changes = merge_snapshot(
            &state,
            &modified(json!({"test": true})),
            &identity(),
            json!({"test": {"test2": {"@": 1000, "_": "hi2"}}}),
            &no_guard,
        );

        assert_eq!(changes, 2);
        assert_eq!(state.snapshot(), json!({"test": {"test2": "hi2", "test3": ""}}));
        assert_eq!(state.get_modified(&path("test/test2")), Some(Marker::At(1000)));
    }

    #[test]
    fn test_newer_local_marker_keeps_local() {
        let state = MemoryState::new(json!({"test": {"test2": "local"}}));
        state.set_modified(&path("test/test2"), Some(Marker::At(1001)));

        let changes = merge_snapshot(
            &state,
            &modified(json!({"test": true})),
            &identity(),
            json!({"test": {"test2": {"@": 1000, "_": "remote"}}}),
            &no_guard,
        );

        assert_eq!(changes, 0);
        assert_eq!(state.get(&path("test/test2")), Some(json!("local")));
        assert_eq!(state.get_modified(&path("test/test2")), Some(Marker::At(1001)));
    }

    #[test]
    fn test_untracked_lifts_markers() {
        let state = MemoryState::new(json!({"test": {"test2": "hello", "test3": "hi3"}}));
        merge_snapshot(
            &state,
            &ModifiedSpec::default(),
            &identity(),
            json!({"test": {"@": 1001, "test2": "hello2"}}),
            &no_guard,
        );

        assert_eq!(
            state.snapshot(),
            json!({"test": {"test2": "hello2", "test3": "hi3"}})
        );
        assert_eq!(state.get_modified(&path("test")), Some(Marker::At(1001)));
    }

    #[test]
    fn test_nested_units_in_dictionaries() {
        let state = MemoryState::new(json!({
            "clients": {"clientID": {"profile": {"name": ""}, "outer": {"inner": {"id1": {"text": ""}, "id2": ""}}}}
        }));
        merge_snapshot(
            &state,
            &modified(json!({"clients": {"*": {"*": true, "outer": {"inner": "*"}}}})),
            &identity(),
            json!({"clients": {"clientID": {
                "profile": {"@": 1000, "name": "hi name"},
                "outer": {"inner": {
                    "id1": {"@": 1000, "text": "hi1"},
                    "id2": {"@": 1000, "_": "hi1"}
                }}
            }}}),
            &no_guard,
        );

        assert_eq!(
            state.snapshot(),
            json!({"clients": {"clientID": {
                "profile": {"name": "hi name"},
                "outer": {"inner": {"id1": {"text": "hi1"}, "id2": "hi1"}}
            }}})
        );
        assert_eq!(
            state.get_modified(&path("clients/clientID/outer/inner/id1")),
            Some(Marker::At(1000))
        );
        assert_eq!(
            state.get_modified(&path("clients/clientID/profile")),
            Some(Marker::At(1000))
        );
    }

    #[test]
    fn test_same_snapshot_twice_notifies_once() {
        let state = MemoryState::new(json!({"test": {"test2": ""}}));
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let _subscription = state.on_change(
            &StatePath::root(),
            Arc::new(move |_: &Change| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let spec = modified(json!({"test": true}));
        let snapshot = json!({"test": {"test2": {"@": 1000, "_": "hi"}, "plain": {"a": 1}}});
        merge_snapshot(&state, &spec, &identity(), snapshot.clone(), &no_guard);
        let after_first = notified.load(Ordering::SeqCst);
        assert!(after_first > 0);

        let changes = merge_snapshot(&state, &spec, &identity(), snapshot, &no_guard);
        assert_eq!(changes, 0);
        assert_eq!(notified.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn test_null_snapshot_merges_nothing() {
        let state = MemoryState::new(json!({"test": "keep"}));
        let changes = merge_snapshot(&state, &ModifiedSpec::default(), &identity(), Value::Null, &no_guard);
        assert_eq!(changes, 0);
        assert_eq!(state.snapshot(), json!({"test": "keep"}));
    }

    #[test]
    fn test_guard_protects_pending_untracked() {
        let state = MemoryState::new(json!({"a": "local", "b": "old"}));
        let guard = |p: &StatePath| p.overlaps(&path("a"));
        merge_snapshot(
            &state,
            &ModifiedSpec::default(),
            &identity(),
            json!({"a": "remote", "b": "new"}),
            &guard,
        );
        assert_eq!(state.snapshot(), json!({"a": "local", "b": "new"}));
    }

    #[test]
    fn test_transform_in() {
        let transform = FieldTransform::root(
            FieldMap::parse(&json!({
                "test": {"_": "t", "__obj": {"test2": "t2", "test3": "t3"}},
                "test4": {"_": "t4", "__dict": {"test5": "t5"}}
            }))
            .unwrap(),
        );
        let state = MemoryState::default();
        merge_snapshot(
            &state,
            &modified(json!({"test": true, "test4": true})),
            &transform,
            json!({
                "t": {"t2": {"@": 1000, "_": "hi"}, "t3": {"@": 1000, "_": "hi3"}},
                "t4": {"x": {"@": 1000, "t5": "hi5"}}
            }),
            &no_guard,
        );

        assert_eq!(
            state.snapshot(),
            json!({"test": {"test2": "hi", "test3": "hi3"}, "test4": {"x": {"test5": "hi5"}}})
        );
        assert_eq!(state.get_modified(&path("test4/x")), Some(Marker::At(1000)));
    }

    #[test]
    fn test_locate_stops_at_unit_and_marker() {
        let spec = modified(json!({"test": true}));
        let transform = FieldTransform::root(FieldMap::parse(&json!({"test": "t"})).unwrap());

        let target = locate(&spec, &transform, &path("t/test2/deep"));
        assert_eq!(target.local, path("test/test2"));
        assert_eq!(target.remote, path("t/test2"));
        assert_eq!(target.tracking, Tracking::Unit);

        let target = locate(&spec, &transform, &path("t/@"));
        assert_eq!(target.local, path("test"));
        assert!(matches!(target.tracking, Tracking::Spec(_)));
    }

    #[test]
    fn test_merge_change_from_mirror() {
        let spec = modified(json!({"test": true}));
        let state = MemoryState::new(json!({"test": {"test2": {"a": "old", "b": "keep"}}}));
        let mut mirror = Mirror::new();
        mirror.load(json!({"test": {"test2": {"@": 1000, "a": "new", "b": "keep"}}}));

        let changes = merge_change(
            &state,
            &spec,
            &identity(),
            &mirror,
            &path("test/test2/a"),
            &no_guard,
        );
        assert_eq!(changes, 2);
        assert_eq!(state.get(&path("test/test2/a")), Some(json!("new")));
        assert_eq!(state.get_modified(&path("test/test2")), Some(Marker::At(1000)));
    }

    #[test]
    fn test_stale_delta_keeps_newer_local() {
        let spec = modified(json!({"test": true}));
        let state = MemoryState::new(json!({"test": {"test2": "local"}}));
        state.set_modified(&path("test/test2"), Some(Marker::At(1001)));
        let mut mirror = Mirror::new();
        mirror.load(json!({"test": {"test2": {"@": 1000, "_": "stale"}}}));

        let changes = merge_change(
            &state,
            &spec,
            &identity(),
            &mirror,
            &path("test/test2"),
            &no_guard,
        );
        assert_eq!(changes, 0);
        assert_eq!(state.get(&path("test/test2")), Some(json!("local")));
        assert_eq!(state.get_modified(&path("test/test2")), Some(Marker::At(1001)));
    }

    #[test]
    fn test_remote_deletion_reaches_each_unit() {
        let state = MemoryState::new(json!({"test": {"a": "x", "b": "y"}, "keep": 1}));
        state.set_modified(&path("test/b"), Some(Marker::At(5)));

        merge_snapshot(
            &state,
            &modified(json!({"test": true})),
            &identity(),
            json!({"test": null}),
            &no_guard,
        );

        // The unmarked unit follows the remote; the marked one outlives an
        // unmarked deletion
        assert_eq!(state.get(&path("test/a")), None);
        assert_eq!(state.get(&path("test/b")), Some(json!("y")));
        assert_eq!(state.get(&path("keep")), Some(json!(1)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn lww_picks_newer(local in proptest::option::of(0i64..5000), remote in 0i64..5000) {
                let state = MemoryState::new(json!({"test": {"u": "local"}}));
                if let Some(local) = local {
                    state.set_modified(&path("test/u"), Some(Marker::At(local)));
                }

                merge_snapshot(
                    &state,
                    &modified(json!({"test": true})),
                    &identity(),
                    json!({"test": {"u": {"@": remote, "_": "remote"}}}),
                    &no_guard,
                );

                let expected = match local {
                    Some(local) if remote < local => "local",
                    _ => "remote",
                };
                prop_assert_eq!(state.get(&path("test/u")), Some(json!(expected)));
            }
        }
    }
}
