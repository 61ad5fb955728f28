//! TTL bookkeeping for store keys.

use crate::error::CoreError;
use crate::key::KeyPath;
use std::collections::HashMap;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Maps keys to absolute deadlines in Unix milliseconds.
///
/// Deadlines are independent of store writes: overwriting a key does not
/// cancel its expiry.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    deadlines: HashMap<KeyPath, i64>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or replaces) the deadline of each key to now + `ttl_ms`.
    pub fn expire(&mut self, keys: &[KeyPath], ttl_ms: u64) -> Result<(), CoreError> {
        self.expire_at(keys, ttl_ms, now_millis())
    }

    pub fn expire_at(&mut self, keys: &[KeyPath], ttl_ms: u64, now: i64) -> Result<(), CoreError> {
        if keys.iter().any(KeyPath::is_root) {
            return Err(CoreError::invalid_key("cannot expire the root"));
        }
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        let deadline = now.saturating_add(ttl);
        for key in keys {
            self.deadlines.insert(key.clone(), deadline);
        }
        Ok(())
    }

    /// Cancels the deadlines of `keys`. Returns how many were cancelled.
    pub fn unexpire(&mut self, keys: &[KeyPath]) -> usize {
        keys.iter()
            .filter(|key| self.deadlines.remove(*key).is_some())
            .count()
    }

    /// Absolute deadline of `key`, if one is set.
    pub fn get_expiry(&self, key: &KeyPath) -> Option<i64> {
        self.deadlines.get(key).copied()
    }

    /// Returns and forgets every key whose deadline has passed.
    pub fn extract_expired_keys(&mut self) -> Vec<KeyPath> {
        self.extract_expired_keys_at(now_millis())
    }

    pub fn extract_expired_keys_at(&mut self, now: i64) -> Vec<KeyPath> {
        let mut expired: Vec<KeyPath> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
