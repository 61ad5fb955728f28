//! Hierarchical keys.
//!
//! A key is an ordered sequence of path segments. On the wire a key is either
//! a dot-separated string (`"a.b"`) or an array of segments (`["a", "b"]`).
//! Event paths use the same representation.

use crate::error::CoreError;
use serde_json::Value;
use std::fmt;

/// An ordered sequence of path segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(Vec<String>);

/// Pub/sub topics share the key representation.
pub type EventPath = KeyPath;

impl KeyPath {
    /// The empty path, addressing the root of the store.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parses a dot-separated key. The empty string is the root.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self::root();
        }
        Self(s.split('.').map(str::to_string).collect())
    }

    /// Converts a wire value (string, number or array of those) into a key.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::String(s) => Ok(Self::parse(s)),
            Value::Number(n) => Ok(Self(vec![n.to_string()])),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(CoreError::invalid_key(format!(
                        "segment must be a string or number, got {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self),
            other => Err(CoreError::invalid_key(format!(
                "expected a string or an array of segments, got {}",
                other
            ))),
        }
    }

    /// Converts a list of wire values into keys.
    pub fn from_values(values: &[Value]) -> Result<Vec<Self>, CoreError> {
        values.iter().map(Self::from_value).collect()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `self` followed by the segments of `other`.
    pub fn join(&self, other: &KeyPath) -> KeyPath {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        KeyPath(segments)
    }

    /// Splits into the parent path and the last segment.
    pub fn split_last(&self) -> Option<(KeyPath, &str)> {
        self.0
            .split_last()
            .map(|(last, parent)| (KeyPath(parent.to_vec()), last.as_str()))
    }

    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for KeyPath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}
