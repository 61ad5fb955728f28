//! Hierarchical JSON document store.
//!
//! The store is a single JSON object addressed by [`KeyPath`]s. Object
//! segments are member names; array segments are decimal indices.

use crate::error::CoreError;
use crate::key::KeyPath;
use crate::value::{arith, ArithOp};
use serde_json::{Map, Value};

/// In-memory hierarchical store.
#[derive(Debug, Clone)]
pub struct DataStore {
    root: Value,
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    /// Returns a view whose keys are resolved relative to `base`.
    pub fn view(&mut self, base: Option<KeyPath>) -> StoreView<'_> {
        StoreView {
            store: self,
            base: base.unwrap_or_default(),
        }
    }

    /// Returns a copy of the value at `key`. The root key returns the whole store.
    pub fn get(&self, key: &KeyPath) -> Option<Value> {
        self.lookup(key).cloned()
    }

    /// Returns a snapshot of the whole store.
    pub fn get_all(&self) -> Value {
        self.root.clone()
    }

    pub fn has_key(&self, key: &KeyPath) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of elements or entries under `key`; zero for scalars and absent keys.
    pub fn count(&self, key: &KeyPath) -> usize {
        match self.lookup(key) {
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(map)) => map.len(),
            _ => 0,
        }
    }

    /// Stores `value` at `key`, creating intermediate objects.
    pub fn set(&mut self, key: &KeyPath, value: Value) -> Result<Value, CoreError> {
        reject_root(key, "set")?;
        let slot = self.slot_mut(key)?;
        *slot = value;
        Ok(slot.clone())
    }

    /// Increments the number at `key` by `amount`. An absent key counts as zero.
    pub fn add(&mut self, key: &KeyPath, amount: &Value) -> Result<Value, CoreError> {
        reject_root(key, "add")?;
        let Value::Number(delta) = amount else {
            return Err(CoreError::NotANumber {
                key: format!("{} (argument)", key),
            });
        };
        match self.lookup(key) {
            None | Some(Value::Null) | Some(Value::Number(_)) => {}
            Some(_) => return Err(CoreError::NotANumber { key: key.to_string() }),
        }

        let slot = self.slot_mut(key)?;
        let next = match &*slot {
            Value::Number(current) => arith(ArithOp::Add, current, delta)
                .ok_or_else(|| CoreError::NotANumber { key: key.to_string() })?,
            _ => delta.clone(),
        };
        *slot = Value::Number(next);
        Ok(slot.clone())
    }

    /// Appends `value` to the sequence at `key`.
    ///
    /// Arrays are extended (an array argument is spliced in), strings are
    /// concatenated, and an absent key becomes a new array.
    pub fn concat(&mut self, key: &KeyPath, value: Value) -> Result<Value, CoreError> {
        reject_root(key, "concat")?;
        match (self.lookup(key), &value) {
            (None | Some(Value::Null) | Some(Value::Array(_)), _) => {}
            (Some(Value::String(_)), Value::String(_)) => {}
            _ => return Err(CoreError::NotASequence { key: key.to_string() }),
        }

        let slot = self.slot_mut(key)?;
        match slot {
            Value::Array(items) => match value {
                Value::Array(more) => items.extend(more),
                other => items.push(other),
            },
            Value::String(s) => {
                if let Value::String(more) = value {
                    s.push_str(&more);
                }
            }
            _ => {
                *slot = match value {
                    Value::Array(items) => Value::Array(items),
                    other => Value::Array(vec![other]),
                };
            }
        }
        Ok(slot.clone())
    }

    /// Returns the elements in `[from, to)` of the sequence at `key`.
    ///
    /// Arrays yield elements, objects yield entries in key order, strings
    /// yield characters. Bounds are clamped to the sequence length.
    pub fn get_range(
        &self,
        key: &KeyPath,
        from: usize,
        to: Option<usize>,
    ) -> Result<Option<Value>, CoreError> {
        let Some(value) = self.lookup(key) else {
            return Ok(None);
        };
        let range = |len: usize| clamp(from, to, len);
        let out = match value {
            Value::Array(items) => {
                let (start, end) = range(items.len());
                Value::Array(items[start..end].to_vec())
            }
            Value::Object(map) => {
                let (start, end) = range(map.len());
                Value::Object(
                    map.iter()
                        .skip(start)
                        .take(end - start)
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            }
            Value::String(s) => {
                let (start, end) = range(s.chars().count());
                Value::String(s.chars().skip(start).take(end - start).collect())
            }
            _ => return Err(CoreError::NotASequence { key: key.to_string() }),
        };
        Ok(Some(out))
    }

    /// Removes the elements in `[from, to)` and returns them.
    pub fn remove_range(
        &mut self,
        key: &KeyPath,
        from: usize,
        to: Option<usize>,
    ) -> Result<Option<Value>, CoreError> {
        let Some(value) = self.lookup_mut(key) else {
            return Ok(None);
        };
        let removed = match value {
            Value::Array(items) => {
                let (start, end) = clamp(from, to, items.len());
                Value::Array(items.drain(start..end).collect())
            }
            Value::Object(map) => {
                let (start, end) = clamp(from, to, map.len());
                let doomed: Vec<String> =
                    map.keys().skip(start).take(end - start).cloned().collect();
                let mut removed = Map::new();
                for name in doomed {
                    if let Some(v) = map.remove(&name) {
                        removed.insert(name, v);
                    }
                }
                Value::Object(removed)
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = clamp(from, to, chars.len());
                let removed: String = chars[start..end].iter().collect();
                *s = chars[..start].iter().chain(&chars[end..]).collect();
                Value::String(removed)
            }
            _ => return Err(CoreError::NotASequence { key: key.to_string() }),
        };
        Ok(Some(removed))
    }

    /// Deletes `key` and returns the removed subtree.
    pub fn remove(&mut self, key: &KeyPath) -> Result<Option<Value>, CoreError> {
        let Some((parent, last)) = key.split_last() else {
            return Err(CoreError::invalid_key("cannot remove the root; use removeAll"));
        };
        let removed = match self.lookup_mut(&parent) {
            Some(Value::Object(map)) => map.remove(last),
            Some(Value::Array(items)) => match parse_index(last) {
                Some(index) if index < items.len() => Some(items.remove(index)),
                _ => None,
            },
            _ => None,
        };
        Ok(removed)
    }

    /// Empties the store.
    pub fn remove_all(&mut self) {
        self.root = Value::Object(Map::new());
    }

    /// Removes and returns the last element of the array, or the last entry
    /// of the object, at `key`.
    pub fn pop(&mut self, key: &KeyPath) -> Result<Option<Value>, CoreError> {
        match self.lookup_mut(key) {
            None => Ok(None),
            Some(Value::Array(items)) => Ok(items.pop()),
            Some(Value::Object(map)) => {
                let last = map.keys().next_back().cloned();
                Ok(last.and_then(|name| map.remove(&name)))
            }
            Some(_) => Err(CoreError::NotASequence { key: key.to_string() }),
        }
    }

    fn lookup(&self, key: &KeyPath) -> Option<&Value> {
        let mut current = &self.root;
        for segment in key.segments() {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(parse_index(segment)?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn lookup_mut(&mut self, key: &KeyPath) -> Option<&mut Value> {
        let mut current = &mut self.root;
        for segment in key.segments() {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(parse_index(segment)?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Walks to `key`, creating missing members along the way.
    fn slot_mut(&mut self, key: &KeyPath) -> Result<&mut Value, CoreError> {
        let mut current = &mut self.root;
        for segment in key.segments() {
            current = child_slot(current, segment, key)?;
        }
        Ok(current)
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A store whose keys are resolved relative to a base path.
pub struct StoreView<'a> {
    store: &'a mut DataStore,
    base: KeyPath,
}

impl StoreView<'_> {
    pub fn base(&self) -> &KeyPath {
        &self.base
    }

    fn resolve(&self, key: &KeyPath) -> KeyPath {
        self.base.join(key)
    }

    pub fn get(&self, key: &KeyPath) -> Option<Value> {
        self.store.get(&self.resolve(key))
    }

    /// Snapshot of everything under the base path.
    pub fn get_all(&self) -> Value {
        if self.base.is_root() {
            return self.store.get_all();
        }
        self.store
            .get(&self.base)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn has_key(&self, key: &KeyPath) -> bool {
        self.store.has_key(&self.resolve(key))
    }

    pub fn count(&self, key: &KeyPath) -> usize {
        self.store.count(&self.resolve(key))
    }

    pub fn set(&mut self, key: &KeyPath, value: Value) -> Result<Value, CoreError> {
        let key = self.resolve(key);
        self.store.set(&key, value)
    }

    pub fn add(&mut self, key: &KeyPath, amount: &Value) -> Result<Value, CoreError> {
        let key = self.resolve(key);
        self.store.add(&key, amount)
    }

    pub fn concat(&mut self, key: &KeyPath, value: Value) -> Result<Value, CoreError> {
        let key = self.resolve(key);
        self.store.concat(&key, value)
    }

    pub fn get_range(
        &self,
        key: &KeyPath,
        from: usize,
        to: Option<usize>,
    ) -> Result<Option<Value>, CoreError> {
        self.store.get_range(&self.resolve(key), from, to)
    }

    pub fn remove_range(
        &mut self,
        key: &KeyPath,
        from: usize,
        to: Option<usize>,
    ) -> Result<Option<Value>, CoreError> {
        let key = self.resolve(key);
        self.store.remove_range(&key, from, to)
    }

    pub fn remove(&mut self, key: &KeyPath) -> Result<Option<Value>, CoreError> {
        let key = self.resolve(key);
        self.store.remove(&key)
    }

    /// Empties the subtree under the base path.
    pub fn remove_all(&mut self) -> Result<(), CoreError> {
        if self.base.is_root() {
            self.store.remove_all();
        } else {
            self.store.remove(&self.base)?;
        }
        Ok(())
    }

    pub fn pop(&mut self, key: &KeyPath) -> Result<Option<Value>, CoreError> {
        let key = self.resolve(key);
        self.store.pop(&key)
    }
}

fn reject_root(key: &KeyPath, op: &str) -> Result<(), CoreError> {
    if key.is_root() {
        return Err(CoreError::invalid_key(format!("{} requires a non-empty key", op)));
    }
    Ok(())
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

fn clamp(from: usize, to: Option<usize>, len: usize) -> (usize, usize) {
    let end = to.unwrap_or(len).min(len);
    let start = from.min(end);
    (start, end)
}

fn child_slot<'v>(
    node: &'v mut Value,
    segment: &str,
    key: &KeyPath,
) -> Result<&'v mut Value, CoreError> {
    if !matches!(node, Value::Object(_) | Value::Array(_)) {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Array(items) => {
            let index = parse_index(segment).ok_or_else(|| {
                CoreError::invalid_key(format!(
                    "segment '{}' of '{}' must be an array index",
                    segment, key
                ))
            })?;
            if index == items.len() {
                items.push(Value::Null);
            }
            items.get_mut(index).ok_or_else(|| CoreError::IndexOutOfRange {
                key: key.to_string(),
                index,
            })
        }
        Value::Object(map) => Ok(map.entry(segment.to_string()).or_insert(Value::Null)),
        _ => Err(CoreError::invalid_key(format!("cannot descend into '{}'", key))),
    }
}
