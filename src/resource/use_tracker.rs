//! Reference counting of active consumers per key.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::keys::CacheKey;

/// Opaque identity of a consumer holding resource entries alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConsumerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receipt returned by `use`; hand it back to `free` to release the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseToken<K> {
    pub key: K,
    pub consumer: ConsumerId,
}

/// Consumer lists per key.
///
/// A key appears in the table only while at least one consumer holds it.
#[derive(Debug)]
pub struct UseTracker<K> {
    uses: HashMap<K, Vec<ConsumerId>>,
}

impl<K: CacheKey> UseTracker<K> {
    pub fn new() -> Self {
        Self {
            uses: HashMap::new(),
        }
    }

    /// Record one more use of `key` by `consumer`.
    ///
    /// Returns true when the key went from unused to used.
    pub fn use_key(&mut self, key: &K, consumer: ConsumerId) -> bool {
        let consumers = self.uses.entry(key.clone()).or_default();
        consumers.push(consumer);
        consumers.len() == 1
    }

    /// Drop one use of `key` by `consumer`.
    ///
    /// Returns true when the last consumer released the key. Freeing a
    /// consumer that never used the key changes nothing.
    pub fn free(&mut self, key: &K, consumer: ConsumerId) -> bool {
        let Some(consumers) = self.uses.get_mut(key) else {
            return false;
        };
        let Some(position) = consumers.iter().position(|id| *id == consumer) else {
            return false;
        };
        consumers.remove(position);
        if consumers.is_empty() {
            self.uses.remove(key);
            return true;
        }
        false
    }

    pub fn is_used(&self, key: &K) -> bool {
        self.uses.contains_key(key)
    }

    pub fn count(&self, key: &K) -> usize {
        self.uses.get(key).map_or(0, Vec::len)
    }

    pub fn consumers(&self, key: &K) -> &[ConsumerId] {
        self.uses.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Forget every use of `key`, whoever holds it.
    pub fn remove(&mut self, key: &K) {
        self.uses.remove(key);
    }

    pub fn used_keys(&self) -> impl Iterator<Item = &K> {
        self.uses.keys()
    }

    pub fn clear(&mut self) {
        self.uses.clear();
    }
}

impl<K: CacheKey> Default for UseTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_then_free_is_net_zero() {
        let mut tracker = UseTracker::new();
        let consumer = ConsumerId::new();

        assert!(tracker.use_key(&"a", consumer));
        assert_eq!(tracker.count(&"a"), 1);
        assert!(tracker.free(&"a", consumer));
        assert_eq!(tracker.count(&"a"), 0);
        assert!(!tracker.is_used(&"a"));
    }

    #[test]
    fn freeing_unknown_consumer_keeps_other_counts() {
        let mut tracker = UseTracker::new();
        let holder = ConsumerId::new();
        let stranger = ConsumerId::new();

        tracker.use_key(&"a", holder);
        assert!(!tracker.free(&"a", stranger));
        assert!(!tracker.free(&"never-used", stranger));

        assert_eq!(tracker.consumers(&"a"), &[holder]);
    }

    #[test]
    fn repeated_use_needs_matching_frees() {
        let mut tracker = UseTracker::new();
        let consumer = ConsumerId::new();

        assert!(tracker.use_key(&1, consumer));
        assert!(!tracker.use_key(&1, consumer));
        assert!(!tracker.free(&1, consumer));
        assert!(tracker.is_used(&1));
        assert!(tracker.free(&1, consumer));
    }
}
