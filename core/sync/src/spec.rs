//! Declarative specs steering the sync passes.
//!
//! Two spec trees mirror the shape of the state tree:
//! - [`ModifiedSpec`] declares which nodes are independently tracked units
//!   carrying a modified marker.
//! - [`FieldTransform`] / [`FieldMap`] declare how local field names map to
//!   remote field names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use treesync_common::{Error, Result, MARKER_KEY, VALUE_KEY};

const WILDCARD: &str = "*";
const OBJECT_KEY: &str = "__obj";
const DICT_KEY: &str = "__dict";

/// Rule for children not named explicitly in a [`ModifiedSpec`].
#[derive(Debug, Clone, Default, PartialEq)]
enum Rest {
    /// Not tracked.
    #[default]
    Untracked,
    /// Each child is a tracked unit covering its whole subtree.
    Units,
    /// Each child is described by the nested spec.
    Each(Box<ModifiedSpec>),
}

/// How a child of a [`ModifiedSpec`] node is tracked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildTracking<'a> {
    /// The child is an interior node with its own spec.
    Spec(&'a ModifiedSpec),
    /// The child is a tracked unit.
    Unit,
    /// The child carries no tracking.
    Untracked,
}

/// Timestamp-tracking spec for one node.
///
/// Parsed from the `query_by_modified` configuration:
/// - `true` or `"*"`: every child of this node is a tracked unit
/// - `{"name": spec, ...}`: explicit named children
/// - `{"*": true}` inside an object: every unnamed child is a unit
/// - `{"*": spec}` inside an object: `spec` applies to every unnamed child
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifiedSpec {
    named: BTreeMap<String, ModifiedSpec>,
    rest: Rest,
}

impl ModifiedSpec {
    /// A spec making every child of the node a tracked unit.
    pub fn units() -> Self {
        Self {
            named: BTreeMap::new(),
            rest: Rest::Units,
        }
    }

    /// Parse a spec from its JSON form.
    ///
    /// # Errors
    /// - `InvalidSpec` for numbers, arrays or strings other than `"*"`
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Null | Value::Bool(false) => Ok(Self::default()),
            Value::Bool(true) => Ok(Self::units()),
            Value::String(s) if s == WILDCARD => Ok(Self::units()),
            Value::Object(map) => {
                let mut spec = Self::default();
                for (key, child) in map {
                    if key == MARKER_KEY {
                        return Err(Error::InvalidSpec(format!(
                            "'{}' is reserved and cannot be tracked",
                            MARKER_KEY
                        )));
                    }
                    if key == WILDCARD {
                        spec.rest = match child {
                            Value::Bool(true) => Rest::Units,
                            Value::Null | Value::Bool(false) => Rest::Untracked,
                            other => Rest::Each(Box::new(Self::parse(other)?)),
                        };
                    } else {
                        spec.named.insert(key.clone(), Self::parse(child)?);
                    }
                }
                Ok(spec)
            }
            other => Err(Error::InvalidSpec(format!(
                "Unsupported modified spec: {}",
                other
            ))),
        }
    }

    /// JSON form accepted by [`ModifiedSpec::parse`].
    pub fn to_value(&self) -> Value {
        let rest = match &self.rest {
            Rest::Untracked => None,
            Rest::Units => Some(Value::Bool(true)),
            Rest::Each(spec) => Some(spec.to_value()),
        };

        if self.named.is_empty() {
            return match rest {
                None => Value::Bool(false),
                Some(Value::Bool(true)) => Value::Bool(true),
                Some(nested) => {
                    let mut map = Map::new();
                    map.insert(WILDCARD.to_string(), nested);
                    Value::Object(map)
                }
            };
        }

        let mut map: Map<String, Value> = self
            .named
            .iter()
            .map(|(key, spec)| (key.clone(), spec.to_value()))
            .collect();
        if let Some(rest) = rest {
            map.insert(WILDCARD.to_string(), rest);
        }
        Value::Object(map)
    }

    /// Whether no node below this one is tracked.
    pub fn is_untracked(&self) -> bool {
        self.rest == Rest::Untracked && self.named.values().all(ModifiedSpec::is_untracked)
    }

    /// Resolve how the child `key` is tracked.
    pub fn child(&self, key: &str) -> ChildTracking<'_> {
        if let Some(spec) = self.named.get(key) {
            return if spec.is_untracked() {
                ChildTracking::Untracked
            } else {
                ChildTracking::Spec(spec)
            };
        }
        match &self.rest {
            Rest::Untracked => ChildTracking::Untracked,
            Rest::Units => ChildTracking::Unit,
            Rest::Each(spec) => ChildTracking::Spec(spec),
        }
    }
}

impl TryFrom<Value> for ModifiedSpec {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ModifiedSpec> for Value {
    fn from(spec: ModifiedSpec) -> Self {
        spec.to_value()
    }
}

impl Serialize for ModifiedSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ModifiedSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// How the children of a transformed node are mapped.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Children {
    /// Children pass through unchanged.
    #[default]
    None,
    /// Fixed named children (`__obj`).
    Object(FieldMap),
    /// Data-determined children (`__dict`); keys are kept, each value is
    /// transformed by the inner spec.
    Dict(Box<FieldTransform>),
}

/// Field transform for one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTransform {
    /// Remote name of this node (`_`); `None` keeps the local name.
    name: Option<String>,
    children: Children,
}

impl FieldTransform {
    /// Transform for a root whose children are mapped by `map`.
    pub fn root(map: FieldMap) -> Self {
        Self {
            name: None,
            children: Children::Object(map),
        }
    }

    /// Rename-only transform.
    pub fn renamed(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            children: Children::None,
        }
    }

    /// Remote name, if renamed.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn children(&self) -> &Children {
        &self.children
    }

    /// Whether this transform maps any child.
    pub fn has_children(&self) -> bool {
        !matches!(self.children, Children::None)
    }

    /// Parse a node transform: `"remoteName"` or
    /// `{"_": name, "__obj": FieldMap}` / `{"_": name, "__dict": FieldMap}`.
    ///
    /// # Errors
    /// - `InvalidSpec` on unknown keys, both `__obj` and `__dict`, or
    ///   non-string names
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => {
                check_name(name)?;
                Ok(Self::renamed(name.clone()))
            }
            Value::Object(map) => {
                let mut transform = Self::default();
                for (key, child) in map {
                    match key.as_str() {
                        VALUE_KEY => {
                            let name = child.as_str().ok_or_else(|| {
                                Error::InvalidSpec(format!("'{}' must be a string", VALUE_KEY))
                            })?;
                            check_name(name)?;
                            transform.name = Some(name.to_string());
                        }
                        OBJECT_KEY | DICT_KEY if transform.has_children() => {
                            return Err(Error::InvalidSpec(format!(
                                "'{}' and '{}' cannot be combined",
                                OBJECT_KEY, DICT_KEY
                            )));
                        }
                        OBJECT_KEY => transform.children = Children::Object(FieldMap::parse(child)?),
                        DICT_KEY => {
                            transform.children = Children::Dict(Box::new(Self::parse_dict_inner(child)?))
                        }
                        other => {
                            return Err(Error::InvalidSpec(format!(
                                "Unknown transform key '{}'",
                                other
                            )));
                        }
                    }
                }
                Ok(transform)
            }
            other => Err(Error::InvalidSpec(format!(
                "Unsupported field transform: {}",
                other
            ))),
        }
    }

    /// The inner spec of `__dict` is a field map for each child value,
    /// unless it is itself a node transform.
    fn parse_dict_inner(value: &Value) -> Result<Self> {
        let is_node = value
            .as_object()
            .is_some_and(|map| map.contains_key(OBJECT_KEY) || map.contains_key(DICT_KEY));
        if is_node {
            Self::parse(value)
        } else {
            Ok(Self::root(FieldMap::parse(value)?))
        }
    }

    /// JSON form accepted by [`FieldTransform::parse`].
    pub fn to_value(&self) -> Value {
        match (&self.name, &self.children) {
            (Some(name), Children::None) => Value::String(name.clone()),
            (name, children) => {
                let mut map = Map::new();
                if let Some(name) = name {
                    map.insert(VALUE_KEY.to_string(), Value::String(name.clone()));
                }
                match children {
                    Children::None => {}
                    Children::Object(fields) => {
                        map.insert(OBJECT_KEY.to_string(), fields.to_value());
                    }
                    Children::Dict(inner) => {
                        map.insert(DICT_KEY.to_string(), inner.to_value());
                    }
                }
                Value::Object(map)
            }
        }
    }

    /// Map a local child key to its remote key and transform.
    pub fn outgoing_child(&self, key: &str) -> (String, Option<&FieldTransform>) {
        match &self.children {
            Children::None => (key.to_string(), None),
            Children::Object(fields) => fields.outgoing(key),
            Children::Dict(inner) => (key.to_string(), Some(inner)),
        }
    }

    /// Map a remote child key back to its local key and transform.
    pub fn incoming_child(&self, key: &str) -> (String, Option<&FieldTransform>) {
        match &self.children {
            Children::None => (key.to_string(), None),
            Children::Object(fields) => fields.incoming(key),
            Children::Dict(inner) => (key.to_string(), Some(inner)),
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == MARKER_KEY {
        return Err(Error::InvalidSpec(format!(
            "Invalid remote field name {:?}",
            name
        )));
    }
    Ok(())
}

/// Named child transforms of an object node, indexed both ways.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: BTreeMap<String, FieldTransform>,
    /// Remote name -> local key, for renamed entries.
    reverse: BTreeMap<String, String>,
}

impl FieldMap {
    /// Parse `{localKey: transform, ...}`.
    ///
    /// # Errors
    /// - `InvalidSpec` if the value is not an object, or two local keys
    ///   map to the same remote name
    pub fn parse(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::InvalidSpec(format!("Field map must be an object: {}", value)))?;

        let mut fields = Self::default();
        for (key, child) in map {
            fields.insert(key.clone(), FieldTransform::parse(child)?)?;
        }
        Ok(fields)
    }

    /// Add a transform for the local key `key`.
    ///
    /// # Errors
    /// - `InvalidSpec` if its remote name is already taken
    pub fn insert(&mut self, key: String, transform: FieldTransform) -> Result<()> {
        let remote = transform.name().unwrap_or(&key).to_string();
        if let Some(existing) = self.reverse.get(&remote) {
            return Err(Error::InvalidSpec(format!(
                "'{}' and '{}' both map to remote field '{}'",
                existing, key, remote
            )));
        }
        self.reverse.insert(remote, key.clone());
        self.entries.insert(key, transform);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FieldTransform> {
        self.entries.get(key)
    }

    fn outgoing(&self, key: &str) -> (String, Option<&FieldTransform>) {
        match self.entries.get(key) {
            Some(transform) => (
                transform.name().unwrap_or(key).to_string(),
                Some(transform),
            ),
            None => (key.to_string(), None),
        }
    }

    fn incoming(&self, key: &str) -> (String, Option<&FieldTransform>) {
        match self.reverse.get(key) {
            Some(local) => (local.clone(), self.entries.get(local)),
            None => (key.to_string(), None),
        }
    }

    /// JSON form accepted by [`FieldMap::parse`].
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(key, transform)| (key.clone(), transform.to_value()))
                .collect(),
        )
    }
}

impl Serialize for FieldMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}
