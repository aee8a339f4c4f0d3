//! Helpers for reading and writing JSON-shaped state trees by path.

use serde_json::{Map, Value};

use crate::types::{StatePath, SERVER_TIMESTAMP};

/// Get the value at `path`, if present.
pub fn get_at<'a>(root: &'a Value, path: &StatePath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set the value at `path`, creating intermediate objects as needed.
///
/// A `null` value deletes the key. Non-object values found on the way are
/// replaced by objects. Returns the previous value at `path`.
pub fn set_at(root: &mut Value, path: &StatePath, value: Value) -> Option<Value> {
    let Some((last, parents)) = path.segments().split_last() else {
        return Some(std::mem::replace(root, value));
    };

    let mut current = root;
    for segment in parents {
        if value.is_null() && current.get(segment).is_none() {
            return None;
        }
        current = ensure_object(current)?
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let map = ensure_object(current)?;
    if value.is_null() {
        map.remove(last)
    } else {
        map.insert(last.clone(), value)
    }
}

/// Remove the value at `path`.
pub fn remove_at(root: &mut Value, path: &StatePath) -> Option<Value> {
    set_at(root, path, Value::Null)
}

/// Deep-merge `source` into `target`; objects merge key by key, anything
/// else replaces.
pub fn merge_into(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_into(existing, value)
                    }
                    _ => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Replace every server timestamp sentinel with `time`.
pub fn resolve_sentinels(value: &mut Value, time: i64) {
    match value {
        Value::String(s) if s == SERVER_TIMESTAMP => *value = Value::from(time),
        Value::Object(map) => map.values_mut().for_each(|v| resolve_sentinels(v, time)),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_sentinels(v, time)),
        _ => {}
    }
}

/// The object at `value`, replacing any non-object with an empty one.
fn ensure_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}
