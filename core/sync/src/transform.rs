//! Field transform engine: local shape <-> remote shape.

use serde_json::Value;

use treesync_common::StatePath;

use crate::spec::FieldTransform;
use crate::walker::{walk, Incoming, Outgoing, Rebuild};

/// Rename `value` (local shape) into remote shape.
///
/// Children not named by `spec` pass through under their own name;
/// dictionary keys are never renamed.
pub fn to_remote_shape(value: Value, spec: &FieldTransform) -> Value {
    if !spec.has_children() {
        return value;
    }
    walk(Outgoing(spec), &StatePath::root(), value, &mut Rebuild)
}

/// Rename `value` (remote shape) back into local shape.
pub fn to_local_shape(value: Value, spec: &FieldTransform) -> Value {
    if !spec.has_children() {
        return value;
    }
    walk(Incoming(spec), &StatePath::root(), value, &mut Rebuild)
}

/// Remote path of the local path `path`, and the transform in effect there.
pub fn remote_path<'a>(
    spec: &'a FieldTransform,
    path: &StatePath,
) -> (StatePath, Option<&'a FieldTransform>) {
    let mut remote = StatePath::root();
    let mut current = Some(spec);
    for segment in path.segments() {
        let (key, next) = match current {
            Some(transform) => transform.outgoing_child(segment),
            None => (segment.clone(), None),
        };
        remote = remote.child(&key);
        current = next;
    }
    (remote, current)
}

/// Local path of the remote path `path`, and the transform in effect there.
pub fn local_path<'a>(
    spec: &'a FieldTransform,
    path: &StatePath,
) -> (StatePath, Option<&'a FieldTransform>) {
    let mut local = StatePath::root();
    let mut current = Some(spec);
    for segment in path.segments() {
        let (key, next) = match current {
            Some(transform) => transform.incoming_child(segment),
            None => (segment.clone(), None),
        };
        local = local.child(&key);
        current = next;
    }
    (local, current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::FieldMap;
    use serde_json::json;

    fn root(spec: Value) -> FieldTransform {
        FieldTransform::root(FieldMap::parse(&spec).unwrap())
    }

    #[test]
    fn test_object_mode_renames_declared_children() {
        let spec = root(json!({
            "test": {"_": "t", "__obj": {"test2": "t2", "test3": "t3"}},
            "test4": "t4"
        }));

        let local = json!({
            "test": {"test2": "hi", "test3": "hi3", "extra": 1},
            "test4": "hi4",
            "untouched": {"a": 1}
        });
        let remote = to_remote_shape(local.clone(), &spec);
        assert_eq!(
            remote,
            json!({
                "t": {"t2": "hi", "t3": "hi3", "extra": 1},
                "t4": "hi4",
                "untouched": {"a": 1}
            })
        );
        assert_eq!(to_local_shape(remote, &spec), local);
    }

    #[test]
    fn test_dict_mode_keeps_keys() {
        let spec = root(json!({
            "test": {
                "_": "t",
                "__dict": {
                    "test2": {"_": "t2", "__obj": {"test3": "t3"}},
                    "test4": {"_": "t4", "__dict": {"text": "tt"}}
                }
            }
        }));

        let local = json!({
            "test": {
                "test1": {
                    "test2": {"test3": "hi3"},
                    "test4": {"container1": {"text": "hi1"}}
                }
            }
        });
        let remote = to_remote_shape(local.clone(), &spec);
        assert_eq!(
            remote,
            json!({
                "t": {
                    "test1": {
                        "t2": {"t3": "hi3"},
                        "t4": {"container1": {"tt": "hi1"}}
                    }
                }
            })
        );
        assert_eq!(to_local_shape(remote, &spec), local);
    }

    #[test]
    fn test_markers_survive_transform() {
        let spec = root(json!({"test": {"_": "t", "__obj": {"test2": "t2"}}}));
        let local = json!({"test": {"@": "__serverTimestamp", "test2": {"@": 1, "_": "x"}}});
        let remote = to_remote_shape(local, &spec);
        assert_eq!(
            remote,
            json!({"t": {"@": "__serverTimestamp", "t2": {"@": 1, "_": "x"}}})
        );
    }

    #[test]
    fn test_path_mapping() {
        let spec = root(json!({
            "test": {"_": "t", "__dict": {"test4": {"_": "t4", "__dict": {"text": "tt"}}}}
        }));

        let local = StatePath::parse("test/id/test4/c1/text").unwrap();
        let (remote, _) = remote_path(&spec, &local);
        assert_eq!(remote.to_string(), "/t/id/t4/c1/tt");

        let (back, transform) = local_path(&spec, &remote);
        assert_eq!(back, local);
        assert!(transform.is_some());

        let (unmapped, transform) = remote_path(&spec, &StatePath::parse("other/x").unwrap());
        assert_eq!(unmapped.to_string(), "/other/x");
        assert!(transform.is_none());
    }

    #[test]
    fn test_primitive_against_object_spec_passes_through() {
        let spec = root(json!({"test": {"_": "t", "__obj": {"a": "b"}}}));
        let remote = to_remote_shape(json!({"test": "flat"}), &spec);
        assert_eq!(remote, json!({"t": "flat"}));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use serde_json::Map;

        fn leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                "[a-z ]{0,8}".prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
            ]
        }

        fn tree() -> impl Strategy<Value = Value> {
            leaf().prop_recursive(4, 32, 6, |inner| {
                prop::collection::btree_map("[c-s]{1,3}|test|test2|text|a|b", inner, 0..5)
                    .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>()))
            })
        }

        proptest! {
            #[test]
            fn remote_then_local_is_identity(value in tree()) {
                let spec = root(json!({
                    "test": {"_": "t", "__dict": {"test2": "t2", "text": {"_": "tt", "__obj": {"a": "aa"}}}},
                    "b": "bb"
                }));
                let remote = to_remote_shape(value.clone(), &spec);
                prop_assert_eq!(to_local_shape(remote, &spec), value);
            }
        }
    }
}
