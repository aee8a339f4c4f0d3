//! Lockstep traversal of a data tree and a spec tree.
//!
//! Both the field transform and the modified-marker passes are folds over
//! the same recursion: [`walk`] resolves each child against the spec and
//! hands the result to a [`Visitor`], which rebuilds whatever output it
//! needs. Marker keys are lifted off every object before its children are
//! visited and handed to [`Visitor::node`] separately.

use serde_json::{Map, Value};
use tracing::warn;

use treesync_common::{Error, StatePath, MARKER_KEY};

use crate::spec::{ChildTracking, FieldTransform, ModifiedSpec};

/// How a child resolved against the spec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved<S> {
    /// Interior node with a nested spec; the walk continues below it.
    Spec(S),
    /// Terminal: the child's whole subtree is one tracked unit.
    Unit,
    /// No spec applies below this child.
    Unmapped,
}

/// One resolved child: its key on the output side and how to continue.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<S> {
    pub key: String,
    pub kind: Resolved<S>,
}

/// A spec tree the walker can descend.
pub trait SpecTree: Copy {
    /// Whether the spec expects this node to be an object.
    fn has_children(self) -> bool;

    /// Resolve the child `key` of this node.
    fn child(self, key: &str) -> Step<Self>;
}

impl<'a> SpecTree for &'a ModifiedSpec {
    fn has_children(self) -> bool {
        !self.is_untracked()
    }

    fn child(self, key: &str) -> Step<Self> {
        let kind = match ModifiedSpec::child(self, key) {
            ChildTracking::Spec(spec) => Resolved::Spec(spec),
            ChildTracking::Unit => Resolved::Unit,
            ChildTracking::Untracked => Resolved::Unmapped,
        };
        Step {
            key: key.to_string(),
            kind,
        }
    }
}

/// Field transform applied local -> remote.
#[derive(Debug, Clone, Copy)]
pub struct Outgoing<'a>(pub &'a FieldTransform);

/// Field transform applied remote -> local.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a>(pub &'a FieldTransform);

fn transform_step<'a, S>(
    (key, transform): (String, Option<&'a FieldTransform>),
    wrap: impl FnOnce(&'a FieldTransform) -> S,
) -> Step<S> {
    let kind = match transform {
        Some(transform) if transform.has_children() => Resolved::Spec(wrap(transform)),
        _ => Resolved::Unmapped,
    };
    Step { key, kind }
}

impl<'a> SpecTree for Outgoing<'a> {
    fn has_children(self) -> bool {
        self.0.has_children()
    }

    fn child(self, key: &str) -> Step<Self> {
        transform_step(self.0.outgoing_child(key), Outgoing)
    }
}

impl<'a> SpecTree for Incoming<'a> {
    fn has_children(self) -> bool {
        self.0.has_children()
    }

    fn child(self, key: &str) -> Step<Self> {
        transform_step(self.0.incoming_child(key), Incoming)
    }
}

/// Callbacks of a walk. `path` is always the input-side path.
pub trait Visitor {
    type Output;

    /// A tracked unit; not descended.
    fn unit(&mut self, path: &StatePath, value: Value) -> Self::Output;

    /// A subtree no spec applies to.
    fn unmapped(&mut self, path: &StatePath, value: Value) -> Self::Output;

    /// A non-object value where the spec is an interior node.
    fn leaf(&mut self, path: &StatePath, value: Value) -> Self::Output;

    /// An object, after its children were visited. `children` carry their
    /// output-side keys.
    fn node(
        &mut self,
        path: &StatePath,
        marker: Option<Value>,
        children: Vec<(String, Self::Output)>,
    ) -> Self::Output;
}

/// Walk `value` at `path` together with `spec`.
pub fn walk<S: SpecTree, V: Visitor>(
    spec: S,
    path: &StatePath,
    value: Value,
    visitor: &mut V,
) -> V::Output {
    match value {
        Value::Object(mut map) => {
            let marker = map.remove(MARKER_KEY);
            let mut children = Vec::with_capacity(map.len());
            for (key, child) in map {
                let child_path = path.child(&key);
                let step = spec.child(&key);
                let output = match step.kind {
                    Resolved::Spec(nested) => walk(nested, &child_path, child, visitor),
                    Resolved::Unit => visitor.unit(&child_path, child),
                    Resolved::Unmapped => visitor.unmapped(&child_path, child),
                };
                children.push((step.key, output));
            }
            visitor.node(path, marker, children)
        }
        Value::Null => visitor.leaf(path, Value::Null),
        other => {
            if spec.has_children() {
                let err = Error::TransformMismatch(format!(
                    "expected an object at {}, found {}",
                    path, other
                ));
                warn!("{}; passing the value through", err);
            }
            visitor.leaf(path, other)
        }
    }
}

/// Visitor rebuilding the tree under output-side keys, markers kept.
#[derive(Debug, Default)]
pub struct Rebuild;

impl Visitor for Rebuild {
    type Output = Value;

    fn unit(&mut self, _path: &StatePath, value: Value) -> Value {
        value
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

/// Reassemble an object from a lifted marker and rebuilt children.
pub fn rebuild_node(marker: Option<Value>, children: Vec<(String, Value)>) -> Value {
    let mut map: Map<String, Value> = children.into_iter().collect();
    if let Some(marker) = marker {
        map.insert(MARKER_KEY.to_string(), marker);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Records which paths were visited in which mode.
    #[derive(Default)]
    struct Recorder {
        units: Vec<String>,
        unmapped: Vec<String>,
        leaves: Vec<String>,
    }

    impl Visitor for Recorder {
        type Output = ();

        fn unit(&mut self, path: &StatePath, _value: Value) {
            self.units.push(path.to_string());
        }

        fn unmapped(&mut self, path: &StatePath, _value: Value) {
            self.unmapped.push(path.to_string());
        }

        fn leaf(&mut self, path: &StatePath, _value: Value) {
            self.leaves.push(path.to_string());
        }

        fn node(&mut self, _path: &StatePath, _marker: Option<Value>, _children: Vec<(String, ())>) {}
    }

    #[test]
    fn test_walk_modes() {
        let spec = ModifiedSpec::parse(&json!({"test": {"*": true, "deep": {"x": true}}})).unwrap();
        let data = json!({
            "test": {"a": 1, "b": {"c": 2}, "deep": {"x": {"y": 1}, "z": 3}},
            "other": {"q": 1}
        });

        let mut recorder = Recorder::default();
        walk(&spec, &StatePath::root(), data, &mut recorder);

        assert_eq!(recorder.units, vec!["/test/a", "/test/b", "/test/deep/x/y"]);
        assert_eq!(recorder.unmapped, vec!["/other", "/test/deep/z"]);
        assert!(recorder.leaves.is_empty());
    }

    #[test]
    fn test_walk_shape_mismatch_is_leaf() {
        let spec = ModifiedSpec::parse(&json!({"test": true})).unwrap();
        let mut recorder = Recorder::default();
        walk(&spec, &StatePath::root(), json!({"test": "flat"}), &mut recorder);
        assert_eq!(recorder.leaves, vec!["/test"]);
    }

    #[test]
    fn test_rebuild_keeps_marker() {
        let transform = FieldTransform::parse(&json!({"__obj": {"a": "b"}})).unwrap();
        let out = walk(
            Outgoing(&transform),
            &StatePath::root(),
            json!({"@": 5, "a": 1}),
            &mut Rebuild,
        );
        assert_eq!(out, json!({"@": 5, "b": 1}));
    }
}
