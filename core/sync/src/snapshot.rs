//! Local snapshot codec.
//!
//! A snapshot is the whole local-shaped tree as JSON, with each modified
//! marker inlined as `"@"` on the node it belongs to. Decoding lifts every
//! `"@"` it finds back out; no tracking spec is consulted.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

use treesync_common::tree::{get_at, set_at};
use treesync_common::{Marker, Result, StatePath, MARKER_KEY, VALUE_KEY};

use crate::modified::lift_markers;

/// Serialize `tree` with `markers` inlined.
///
/// # Errors
/// - `Serialization` if the tree cannot be encoded
pub fn encode(tree: &Value, markers: &BTreeMap<StatePath, Marker>) -> Result<Vec<u8>> {
    let mut tree = tree.clone();

    // Deepest first, so a parent's marker lands on an object that already
    // holds its children's markers
    for (path, marker) in markers.iter().rev() {
        let inlined = match get_at(&tree, path) {
            Some(Value::Object(map)) => {
                let mut map = map.clone();
                map.insert(MARKER_KEY.to_string(), marker.to_value());
                Value::Object(map)
            }
            Some(Value::Null) | None => {
                let mut map = Map::new();
                map.insert(MARKER_KEY.to_string(), marker.to_value());
                Value::Object(map)
            }
            Some(other) => {
                let mut map = Map::new();
                map.insert(MARKER_KEY.to_string(), marker.to_value());
                map.insert(VALUE_KEY.to_string(), other.clone());
                Value::Object(map)
            }
        };
        if path.is_root() {
            tree = inlined;
        } else {
            set_at(&mut tree, path, inlined);
        }
    }

    let bytes = serde_json::to_vec(&tree)?;
    trace!("Encoded local snapshot ({} bytes, {} markers)", bytes.len(), markers.len());
    Ok(bytes)
}

/// Parse a snapshot into the plain tree and its markers.
///
/// # Errors
/// - `Serialization` on malformed JSON
pub fn decode(bytes: &[u8]) -> Result<(Value, Vec<(StatePath, Marker)>)> {
    let raw: Value = serde_json::from_slice(bytes)?;
    let mut markers = Vec::new();
    let tree = lift_markers(raw, &StatePath::root(), &mut markers);
    Ok((tree, markers))
}
