//! Typed configuration values and insertion-ordered maps
//!
//! Job configuration arrives as nested mappings (from JSON, YAML, TOML or the
//! command line). It is held as a [`ConfigTree`] whose leaves are
//! [`ParamValue`]s, so flattening and expansion never need to inspect
//! untyped data at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Result, ScriptError};

/// A leaf value of the configuration tree.
///
/// Lists are leaves too: they are never recursed into by flattening, and a
/// grid-searched list may itself contain lists.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn is_list(&self) -> bool {
        matches!(self, ParamValue::List(_))
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Equality that compares integers and floats by numeric value, so
    /// `1` matches `1.0`. Lists compare element-wise the same way.
    pub fn loosely_eq(&self, other: &ParamValue) -> bool {
        match (self, other) {
            (ParamValue::Int(a), ParamValue::Float(b))
            | (ParamValue::Float(b), ParamValue::Int(a)) => *a as f64 == *b,
            (ParamValue::List(a), ParamValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_eq(y))
            }
            _ => self == other,
        }
    }

    /// Convert a JSON value. Objects are not leaves and are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<ParamValue> {
        Ok(match value {
            serde_json::Value::Null => ParamValue::Null,
            serde_json::Value::Bool(b) => ParamValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ParamValue::Str(s.clone()),
            serde_json::Value::Array(items) => ParamValue::List(
                items
                    .iter()
                    .map(ParamValue::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(_) => {
                return Err(ScriptError::request(
                    "mappings nested inside lists are not supported",
                ));
            }
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Null => serde_json::Value::Null,
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
            ParamValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ParamValue::to_json).collect())
            }
        }
    }

    /// Decode a value written into a script.
    ///
    /// JSON literals (numbers, booleans, `null`, lists) are decoded as such;
    /// anything else is kept as a plain string.
    pub fn decode_literal(text: &str) -> ParamValue {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => {
                ParamValue::from_json(&json).unwrap_or_else(|_| ParamValue::Str(text.to_string()))
            }
            Err(_) => ParamValue::Str(text.to_string()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "null"),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            // Keep a decimal point so the value decodes back as a float
            ParamValue::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{:.1}", x),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::List(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl Serialize for ParamValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        ParamValue::from_json(&json).map_err(serde::de::Error::custom)
    }
}

/// A string-keyed map that iterates in insertion order.
///
/// Re-inserting an existing key replaces the value in place, keeping the
/// key's original position.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Insert a value, returning the previous value for the key if any
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        match self.position(&key) {
            Some(idx) => Some(std::mem::replace(&mut self.entries[idx].1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.position(key).map(|idx| &self.entries[idx].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.position(key).map(move |idx| &mut self.entries[idx].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Remove a key, preserving the order of the remaining entries
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.position(key).map(|idx| self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<V> IntoIterator for OrderedMap<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MapVisitor<V>(std::marker::PhantomData<V>);

        impl<'de, V: Deserialize<'de>> serde::de::Visitor<'de> for MapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map with string keys")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut map = OrderedMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(MapVisitor(std::marker::PhantomData))
    }
}

/// A node of the configuration tree
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Value(ParamValue),
    Tree(ConfigTree),
}

impl ConfigNode {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigNode::Value(value) => value.to_json(),
            ConfigNode::Tree(tree) => tree.to_json(),
        }
    }
}

/// Nested, insertion-ordered job configuration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigTree {
    entries: OrderedMap<ConfigNode>,
}

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a leaf value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> &mut Self {
        self.entries.insert(key, ConfigNode::Value(value.into()));
        self
    }

    /// Insert a nested tree
    pub fn set_tree(&mut self, key: impl Into<String>, tree: ConfigTree) -> &mut Self {
        self.entries.insert(key, ConfigNode::Tree(tree));
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigNode> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfigNode> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigNode)> {
        self.entries.iter()
    }

    /// Deep-merge `other` into `self`.
    ///
    /// Nested trees are merged key by key; any other value in `other`
    /// replaces the existing one.
    pub fn merge(&mut self, other: ConfigTree) {
        for (key, node) in other.entries {
            match (self.entries.get_mut(&key), node) {
                (Some(ConfigNode::Tree(existing)), ConfigNode::Tree(incoming)) => {
                    existing.merge(incoming);
                }
                (_, node) => {
                    self.entries.insert(key, node);
                }
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<ConfigTree> {
        let serde_json::Value::Object(map) = value else {
            return Err(ScriptError::request(
                "the top level of a configuration must be a mapping",
            ));
        };
        let mut tree = ConfigTree::new();
        for (key, value) in map {
            match value {
                serde_json::Value::Object(_) => {
                    tree.set_tree(key.clone(), ConfigTree::from_json(value)?);
                }
                other => {
                    tree.set(key.clone(), ParamValue::from_json(other)?);
                }
            }
        }
        Ok(tree)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for ConfigTree {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        ConfigTree::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ConfigTree {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
