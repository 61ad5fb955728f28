//! The shared database: store, expiry index and event registry.

use crate::error::CoreError;
use crate::events::EventRegistry;
use crate::expiry::{now_millis, ExpiryIndex};
use crate::key::KeyPath;
use crate::script::{Script, ScriptScope};
use crate::store::DataStore;
use serde_json::Value;

/// Everything a command or script can touch.
///
/// The three parts are always mutated together under one lock so that a
/// command or script observes a consistent snapshot.
#[derive(Debug, Default)]
pub struct Database {
    pub store: DataStore,
    pub expiry: ExpiryIndex,
    pub events: EventRegistry,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every key whose expiry has elapsed. Returns the keys removed.
    pub fn sweep_expired(&mut self) -> Vec<KeyPath> {
        self.sweep_expired_at(now_millis())
    }

    pub fn sweep_expired_at(&mut self, now: i64) -> Vec<KeyPath> {
        let expired = self.expiry.extract_expired_keys_at(now);
        for key in &expired {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!("Failed to remove expired key '{}': {}", key, e);
            }
        }
        if !expired.is_empty() {
            tracing::debug!("Expired {} key(s)", expired.len());
        }
        expired
    }

    /// Runs `script` with the store rebased to `base`.
    pub fn run_script(
        &mut self,
        script: &Script,
        base: Option<KeyPath>,
    ) -> Result<Option<Value>, CoreError> {
        let mut scope = ScriptScope {
            store: self.store.view(base),
            expiry: &mut self.expiry,
            events: &self.events,
        };
        script.eval(&mut scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> KeyPath {
        KeyPath::parse(s)
    }

    #[test]
    fn test_sweep_removes_expired_keys() {
        let mut db = Database::new();
        db.store.set(&key("temp"), json!(1)).unwrap();
        db.store.set(&key("keep"), json!(2)).unwrap();
        db.expiry.expire_at(&[key("temp")], 50, 1_000).unwrap();

        assert!(db.sweep_expired_at(1_010).is_empty());
        assert!(db.store.has_key(&key("temp")));

        assert_eq!(db.sweep_expired_at(1_050), vec![key("temp")]);
        assert!(!db.store.has_key(&key("temp")));
        assert!(db.store.has_key(&key("keep")));
    }

    #[test]
    fn test_unexpire_before_sweep_keeps_key() {
        let mut db = Database::new();
        db.store.set(&key("temp"), json!(1)).unwrap();
        db.expiry.expire_at(&[key("temp")], 50, 0).unwrap();
        db.expiry.unexpire(&[key("temp")]);

        assert!(db.sweep_expired_at(10_000).is_empty());
        assert_eq!(db.store.get(&key("temp")), Some(json!(1)));
    }

    #[test]
    fn test_sweep_tolerates_missing_keys() {
        let mut db = Database::new();
        db.expiry.expire_at(&[key("never.set")], 0, 0).unwrap();
        assert_eq!(db.sweep_expired_at(1), vec![key("never.set")]);
        assert_eq!(db.store.get_all(), json!({}));
    }

    #[test]
    fn test_run_script_with_base() {
        let mut db = Database::new();
        db.store.set(&key("ns.x"), json!(10)).unwrap();
        db.events.subscribe(1, key("room"));

        let script = Script::parse("store.get('x') * 2").unwrap();
        assert_eq!(db.run_script(&script, Some(key("ns"))).unwrap(), Some(json!(20)));
        // Without the base, `x` is absent and `null * 2` is a type error.
        assert!(db.run_script(&script, None).is_err());

        let script = Script::parse("events.isWatched('room')").unwrap();
        assert_eq!(db.run_script(&script, None).unwrap(), Some(json!(true)));
    }
}
