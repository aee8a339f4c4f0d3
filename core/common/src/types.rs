//! Common types used throughout treesync.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Reserved key holding a node's modified marker, inline with its fields.
pub const MARKER_KEY: &str = "@";

/// Reserved key holding the value of a marked primitive (`{"@": m, "_": v}`).
pub const VALUE_KEY: &str = "_";

/// Sentinel token asking the backend to substitute its commit time.
pub const SERVER_TIMESTAMP: &str = "__serverTimestamp";

/// A path within the state tree, independent of where it is persisted.
///
/// The same type addresses local-shaped paths and remote-shaped paths;
/// which one a value holds is decided by the code that built it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatePath {
    segments: Vec<String>,
}

impl StatePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Create a path from string segments.
    ///
    /// # Errors
    /// - Returns error if any segment is empty or contains a separator
    pub fn from_segments(segments: Vec<String>) -> crate::Result<Self> {
        for segment in &segments {
            if segment.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "Path segment cannot be empty".to_string(),
                ));
            }
            if segment.contains('/') {
                return Err(crate::Error::InvalidInput(format!(
                    "Path segment cannot contain separators: {}",
                    segment
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Parse a path string into a StatePath.
    ///
    /// Uses '/' as separator; leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let segments: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_segments(segments)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut segments = self.segments.clone();
            segments.pop();
            Some(Self { segments })
        }
    }

    /// Get the last segment.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// Join this path with a validated child segment.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        if child.is_empty() || child.contains('/') {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid path segment: {:?}",
                child
            )));
        }
        Ok(self.child(child))
    }

    /// Append a data-determined key without validation.
    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Self { segments }
    }

    /// Concatenate another path onto this one.
    pub fn concat(&self, other: &StatePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &StatePath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// The remainder of this path below `prefix`.
    pub fn strip_prefix(&self, prefix: &StatePath) -> Option<StatePath> {
        self.segments
            .strip_prefix(prefix.segments.as_slice())
            .map(|rest| Self {
                segments: rest.to_vec(),
            })
    }

    /// Whether either path lies on the other's branch.
    pub fn overlaps(&self, other: &StatePath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.segments.join("/"))
        }
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

/// Modified marker attached to a node's subtree as a whole.
///
/// `Pending` is a local write whose commit time the backend has not yet
/// resolved; it orders after every concrete time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Marker {
    /// Commit time in milliseconds.
    At(i64),
    /// Awaiting the backend's commit time.
    Pending,
}

impl Marker {
    /// Read a marker from its JSON form.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Marker::At),
            Value::String(s) if s == SERVER_TIMESTAMP => Some(Marker::Pending),
            _ => None,
        }
    }

    /// JSON form: a number, or the server timestamp sentinel.
    pub fn to_value(self) -> Value {
        match self {
            Marker::At(time) => Value::from(time),
            Marker::Pending => Value::String(SERVER_TIMESTAMP.to_string()),
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Marker::Pending)
    }
}

impl Ord for Marker {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Marker::At(a), Marker::At(b)) => a.cmp(b),
            (Marker::At(_), Marker::Pending) => Ordering::Less,
            (Marker::Pending, Marker::At(_)) => Ordering::Greater,
            (Marker::Pending, Marker::Pending) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Marker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<Value> for Marker {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        Marker::from_value(&value)
            .ok_or_else(|| crate::Error::Serialization(format!("Not a marker: {}", value)))
    }
}

impl From<Marker> for Value {
    fn from(marker: Marker) -> Self {
        marker.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_path_root() {
        let path = StatePath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert_eq!(StatePath::parse("/").unwrap(), path);
    }

    #[test]
    fn test_state_path_parse() {
        let path = StatePath::parse("/test/testuid/s/").unwrap();
        assert_eq!(path.segments(), &["test", "testuid", "s"]);
        assert_eq!(path.to_string_path(), "/test/testuid/s");
        assert_eq!(StatePath::parse("test/test2").unwrap().len(), 2);
    }

    #[test]
    fn test_state_path_rejects_empty_segment() {
        assert!(StatePath::parse("a//b").is_err());
        assert!(StatePath::root().join("a/b").is_err());
    }

    #[test]
    fn test_prefix_helpers() {
        let base = StatePath::parse("/a/b").unwrap();
        let deep = StatePath::parse("/a/b/c/d").unwrap();

        assert!(deep.starts_with(&base));
        assert!(!base.starts_with(&deep));
        assert!(base.overlaps(&deep));
        assert_eq!(deep.strip_prefix(&base).unwrap().to_string(), "/c/d");
        assert!(base.strip_prefix(&deep).is_none());
        assert_eq!(base.concat(&StatePath::parse("x").unwrap()).to_string(), "/a/b/x");
    }

    #[test]
    fn test_marker_ordering() {
        assert!(Marker::At(1000) < Marker::At(1001));
        assert!(Marker::At(i64::MAX) < Marker::Pending);
        assert_eq!(Marker::Pending.cmp(&Marker::Pending), Ordering::Equal);
    }

    #[test]
    fn test_marker_json_forms() {
        assert_eq!(Marker::from_value(&json!(1000)), Some(Marker::At(1000)));
        assert_eq!(Marker::from_value(&json!(SERVER_TIMESTAMP)), Some(Marker::Pending));
        assert_eq!(Marker::from_value(&json!("yesterday")), None);
        assert_eq!(Marker::Pending.to_value(), json!("__serverTimestamp"));

        let restored: Marker = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(restored, Marker::At(42));
    }
}
