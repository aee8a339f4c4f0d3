//! Pending-write tree.
//!
//! Records local mutations not yet acknowledged by the remote, shaped like
//! the state tree. A replacement at a path supersedes everything below it;
//! later writes below a replacement refine its captured value.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use treesync_common::tree::set_at;
use treesync_common::StatePath;

/// A node of the pending tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingNode {
    /// Finer pending entries below this path.
    Internal(BTreeMap<String, PendingNode>),
    /// Captured value replacing the whole subtree at this path.
    Replacement(Value),
}

/// Not-yet-flushed local mutations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTree {
    root: Option<PendingNode>,
}

impl PendingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<&PendingNode> {
        self.root.as_ref()
    }

    /// Record a full-subtree write of `value` at `path`.
    ///
    /// # Postconditions
    /// - Under an existing replacement, `value` is folded into it
    /// - Otherwise a replacement sits at `path` and nothing pending remains
    ///   below it
    pub fn set(&mut self, path: &StatePath, value: Value) {
        let segments = path.segments();
        let mut node = self
            .root
            .get_or_insert_with(|| PendingNode::Internal(BTreeMap::new()));

        for (depth, segment) in segments.iter().enumerate() {
            match node {
                PendingNode::Replacement(captured) => {
                    let rest = segments[depth..]
                        .iter()
                        .fold(StatePath::root(), |rest, s| rest.child(s));
                    set_at(captured, &rest, value);
                    return;
                }
                PendingNode::Internal(children) => {
                    node = children
                        .entry(segment.clone())
                        .or_insert_with(|| PendingNode::Internal(BTreeMap::new()));
                }
            }
        }

        match node {
            PendingNode::Replacement(captured) => *captured = value,
            internal => *internal = PendingNode::Replacement(value),
        }
    }

    /// Record narrow writes of individual fields of the object at `path`.
    pub fn assign(&mut self, path: &StatePath, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.set(&path.child(&key), value);
        }
    }

    /// Take every pending entry, leaving the tree empty.
    pub fn take(&mut self) -> PendingTree {
        std::mem::take(self)
    }

    /// Put back entries taken for a flush that failed.
    ///
    /// Entries recorded since the take win over the restored ones.
    pub fn restore(&mut self, older: PendingTree) {
        let newer = std::mem::replace(self, older);
        for (path, value) in newer.entries() {
            self.set(&path, value.clone());
        }
    }

    /// Every replacement, in path order.
    pub fn entries(&self) -> Vec<(StatePath, &Value)> {
        let mut entries = Vec::new();
        if let Some(root) = &self.root {
            collect(root, StatePath::root(), &mut entries);
        }
        entries
    }

    /// Number of replacements.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether any pending entry lies on the branch of `path`.
    pub fn touches(&self, path: &StatePath) -> bool {
        let Some(mut node) = self.root.as_ref() else {
            return false;
        };
        for segment in path.segments() {
            match node {
                PendingNode::Replacement(_) => return true,
                PendingNode::Internal(children) => match children.get(segment) {
                    Some(child) => node = child,
                    None => return false,
                },
            }
        }
        true
    }
}

fn collect<'a>(node: &'a PendingNode, path: StatePath, out: &mut Vec<(StatePath, &'a Value)>) {
    match node {
        PendingNode::Replacement(value) => out.push((path, value)),
        PendingNode::Internal(children) => {
            for (key, child) in children {
                collect(child, path.child(key), out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> StatePath {
        StatePath::parse(s).unwrap()
    }

    fn entries(tree: &PendingTree) -> Vec<(String, Value)> {
        tree.entries()
            .into_iter()
            .map(|(p, v)| (p.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_narrow_entries() {
        let mut pending = PendingTree::new();
        pending.set(&path("test/test2"), json!("hi"));
        pending.set(&path("test/test3"), json!("hi2"));

        assert_eq!(
            entries(&pending),
            vec![
                ("/test/test2".to_string(), json!("hi")),
                ("/test/test3".to_string(), json!("hi2"))
            ]
        );
    }

    #[test]
    fn test_full_set_collapses_then_refines() {
        let mut pending = PendingTree::new();
        pending.set(&path("test/test2"), json!("hi"));
        pending.set(&path("test/test3"), json!("hi2"));
        pending.set(&path("test"), json!({"test2": "test2 hi", "test3": "test3 hi"}));

        assert_eq!(
            entries(&pending),
            vec![("/test".to_string(), json!({"test2": "test2 hi", "test3": "test3 hi"}))]
        );

        pending.set(&path("test/test3"), json!("test33333"));
        assert_eq!(
            entries(&pending),
            vec![("/test".to_string(), json!({"test2": "test2 hi", "test3": "test33333"}))]
        );
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_delete_under_replacement() {
        let mut pending = PendingTree::new();
        pending.set(&path("a"), json!({"b": 1, "c": 2}));
        pending.set(&path("a/b"), Value::Null);
        assert_eq!(entries(&pending), vec![("/a".to_string(), json!({"c": 2}))]);
    }

    #[test]
    fn test_assign_is_narrow() {
        let mut pending = PendingTree::new();
        let mut fields = Map::new();
        fields.insert("x".to_string(), json!(1));
        fields.insert("y".to_string(), json!(2));
        pending.assign(&path("obj"), fields);

        assert_eq!(pending.len(), 2);
        assert!(pending.touches(&path("obj")));
        assert!(pending.touches(&path("obj/x/deeper")));
        assert!(!pending.touches(&path("obj/z")));
        assert!(!pending.touches(&path("other")));
    }

    #[test]
    fn test_take_and_restore() {
        let mut pending = PendingTree::new();
        pending.set(&path("a"), json!(1));
        pending.set(&path("b"), json!(2));

        let taken = pending.take();
        assert!(pending.is_empty());

        pending.set(&path("b"), json!(3));
        pending.restore(taken);

        assert_eq!(
            entries(&pending),
            vec![("/a".to_string(), json!(1)), ("/b".to_string(), json!(3))]
        );
    }

    #[test]
    fn test_root_replacement() {
        let mut pending = PendingTree::new();
        pending.set(&path("a/b"), json!(1));
        pending.set(&StatePath::root(), json!({"a": {"b": 2}}));
        pending.set(&path("a/c"), json!(3));

        assert_eq!(
            entries(&pending),
            vec![("/".to_string(), json!({"a": {"b": 2, "c": 3}}))]
        );
        assert!(pending.touches(&path("anything")));
    }
}
