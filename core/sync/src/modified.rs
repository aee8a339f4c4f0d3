//! Modified-timestamp policy.
//!
//! Decides which nodes are tracked units, annotates outgoing unit writes
//! with the server timestamp sentinel, and lifts inline `"@"` markers off
//! incoming data.

use serde_json::{Map, Value};
use tracing::warn;

use treesync_common::{Marker, StatePath, MARKER_KEY, VALUE_KEY};

use crate::spec::{ChildTracking, ModifiedSpec};
use crate::walker::{rebuild_node, walk, Visitor};

/// Tracking state at a path, found by descending a [`ModifiedSpec`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tracking<'a> {
    /// Interior node of the spec.
    Spec(&'a ModifiedSpec),
    /// Root of a tracked unit.
    Unit,
    /// Strictly below a tracked unit.
    InsideUnit,
    /// No tracking applies.
    Untracked,
}

impl<'a> Tracking<'a> {
    /// Tracking state of the child `key`.
    pub fn descend(self, key: &str) -> Tracking<'a> {
        match self {
            Tracking::Spec(spec) => match spec.child(key) {
                ChildTracking::Spec(child) => Tracking::Spec(child),
                ChildTracking::Unit => Tracking::Unit,
                ChildTracking::Untracked => Tracking::Untracked,
            },
            Tracking::Unit | Tracking::InsideUnit => Tracking::InsideUnit,
            Tracking::Untracked => Tracking::Untracked,
        }
    }

    /// Tracking state at `path` below this node.
    pub fn at(self, path: &StatePath) -> Tracking<'a> {
        path.segments()
            .iter()
            .fold(self, |tracking, segment| tracking.descend(segment))
    }
}

/// Whether `path` is the root of an independently tracked subtree.
pub fn is_tracked_unit(spec: &ModifiedSpec, path: &StatePath) -> bool {
    Tracking::Spec(spec).at(path) == Tracking::Unit
}

/// The tracked unit containing `path`, if any (possibly `path` itself).
pub fn enclosing_unit(spec: &ModifiedSpec, path: &StatePath) -> Option<StatePath> {
    let mut tracking = Tracking::Spec(spec);
    let mut prefix = StatePath::root();
    for segment in path.segments() {
        tracking = tracking.descend(segment);
        prefix = prefix.child(segment);
        match tracking {
            Tracking::Unit => return Some(prefix),
            Tracking::Untracked => return None,
            _ => {}
        }
    }
    None
}

/// Storage path of a unit's marker.
pub fn marker_path_for(unit: &StatePath) -> StatePath {
    unit.child(MARKER_KEY)
}

/// The sentinel asking the backend to stamp its commit time.
pub fn sentinel() -> Value {
    Marker::Pending.to_value()
}

/// Annotate a whole unit's outgoing payload with the sentinel.
///
/// Objects carry the marker inline; primitives are wrapped as
/// `{"@": sentinel, "_": value}`; a deleted unit becomes the tombstone
/// `{"@": sentinel}`.
pub fn annotate_outgoing(payload: Value) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert(VALUE_KEY.to_string(), other);
            map
        }
    };
    map.insert(MARKER_KEY.to_string(), sentinel());
    Value::Object(map)
}

/// Annotate every tracked unit inside `value`, which sits at `path` with
/// node spec `spec`. Returns the annotated value and the unit paths.
pub fn annotate_units(
    spec: &ModifiedSpec,
    path: &StatePath,
    value: Value,
) -> (Value, Vec<StatePath>) {
    let mut annotate = Annotate::default();
    let value = walk(spec, path, value, &mut annotate);
    (value, annotate.units)
}

#[derive(Default)]
struct Annotate {
    units: Vec<StatePath>,
}

impl Visitor for Annotate {
    type Output = Value;

    fn unit(&mut self, path: &StatePath, value: Value) -> Value {
        self.units.push(path.clone());
        annotate_outgoing(value)
    }

    fn unmapped(&mut self, _path: &StatePath, value: Value) -> Value {
        value
    }

    fn leaf(&mut self, _path: &StatePath, value: Value) -> Value {
        value
    }

    fn node(&mut self, _path: &StatePath, marker: Option<Value>, children: Vec<(String, Value)>) -> Value {
        rebuild_node(marker, children)
    }
}

/// Units affected by writing `value` at `path`: the enclosing unit, or
/// else every unit inside the written value.
pub fn touched_units(spec: &ModifiedSpec, path: &StatePath, value: &Value) -> Vec<StatePath> {
    if let Some(unit) = enclosing_unit(spec, path) {
        return vec![unit];
    }
    match Tracking::Spec(spec).at(path) {
        Tracking::Spec(node) => {
            let mut units = Vec::new();
            collect_units(node, path, value, &mut units);
            units
        }
        _ => Vec::new(),
    }
}

fn collect_units(spec: &ModifiedSpec, path: &StatePath, value: &Value, units: &mut Vec<StatePath>) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, child) in map {
        if key == MARKER_KEY {
            continue;
        }
        match spec.child(key) {
            ChildTracking::Unit => units.push(path.child(key)),
            ChildTracking::Spec(nested) => collect_units(nested, &path.child(key), child, units),
            ChildTracking::Untracked => {}
        }
    }
}

/// Lift inline markers off `value` (at `path`) into `markers`.
///
/// Every object carrying `"@"` yields a marker for its path. An object
/// left as exactly `{"_": v}` becomes `v`; one left empty is a tombstone
/// and becomes `null`. Tombstoned children are dropped from their parent.
pub fn lift_markers(value: Value, path: &StatePath, markers: &mut Vec<(StatePath, Marker)>) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };

    if let Some(raw) = map.remove(MARKER_KEY) {
        match Marker::from_value(&raw) {
            Some(marker) => {
                markers.push((path.clone(), marker));
                if map.is_empty() {
                    return Value::Null;
                }
                if map.len() == 1 {
                    if let Some(inner) = map.remove(VALUE_KEY) {
                        return inner;
                    }
                }
            }
            None => warn!("Ignoring malformed marker at {}: {}", path, raw),
        }
    }

    let lifted: Map<String, Value> = map
        .into_iter()
        .filter_map(|(key, child)| {
            let child = lift_markers(child, &path.child(&key), markers);
            (!child.is_null()).then_some((key, child))
        })
        .collect();
    Value::Object(lifted)
}

/// `value` with every inline marker removed.
pub fn strip_markers(value: Value) -> Value {
    lift_markers(value, &StatePath::root(), &mut Vec::new())
}

/// Split a loaded remote value into its unit marker and plain value.
///
/// Markers nested below the unit are returned alongside.
pub fn extract_incoming(
    unit: &StatePath,
    remote: Value,
) -> (Option<Marker>, Value, Vec<(StatePath, Marker)>) {
    let mut markers = Vec::new();
    let value = lift_markers(remote, unit, &mut markers);
    let marker = markers
        .iter()
        .find(|(path, _)| path == unit)
        .map(|(_, marker)| *marker);
    (marker, value, markers)
}
