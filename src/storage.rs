//! Bounded key/value store with time-based forgetting.
//!
//! The store is a best-effort cache, not durable storage: entries carry the
//! time they were last set, age out of republishing windows, and are evicted
//! least-recently-set when the entry limit is exceeded. Losing an entry is
//! tolerable because the network can recover it from other replicas.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::common::{Id, Value};

/// Default maximum number of stored entries.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug)]
pub struct Storage {
    /// Only `set` promotes an entry, so the cache's LRU order is exactly
    /// `set_at` order, and capacity eviction drops the least recently set.
    entries: LruCache<Id, StoredValue>,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    set_at: Instant,
}

impl Storage {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero");

        Storage {
            entries: LruCache::new(capacity),
        }
    }

    // === Public Methods ===

    /// Returns the stored value for this key, if any, without disturbing the
    /// entry's age.
    pub fn get(&self, key: &Id) -> Option<&Value> {
        self.entries.peek(key).map(|entry| &entry.value)
    }

    /// Overwrite the value for this key and refresh its `set_at`.
    pub fn set(&mut self, key: Id, value: Value) {
        self.entries.put(
            key,
            StoredValue {
                value,
                set_at: Instant::now(),
            },
        );
    }

    /// Entries whose `set_at` predates `now - age`, used for republishing.
    ///
    /// Iteration never touches `set_at`; only a subsequent `set` does.
    pub fn iter_older_than(&self, age: Duration) -> impl Iterator<Item = (Id, Value)> + '_ {
        let cutoff = Instant::now().checked_sub(age);

        self.entries.iter().filter_map(move |(key, entry)| match cutoff {
            Some(cutoff) if entry.set_at <= cutoff => Some((*key, entry.value.clone())),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // === Private Methods ===

    #[cfg(test)]
    fn set_with_time(&mut self, key: Id, value: Value, set_at: Instant) {
        self.entries.put(key, StoredValue { value, set_at });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_and_overwrite() {
        let mut storage = Storage::new(DEFAULT_MAX_ENTRIES);
        let key = Id::from_key("key");

        assert_eq!(storage.get(&key), None);

        storage.set(key, Value::from(1));
        assert_eq!(storage.get(&key), Some(&Value::from(1)));

        storage.set(key, Value::from(2));
        assert_eq!(storage.get(&key), Some(&Value::from(2)));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn evicts_least_recently_set_first() {
        let mut storage = Storage::new(2);

        let a = Id::from_key("a");
        let b = Id::from_key("b");
        let c = Id::from_key("c");

        storage.set(a, Value::from("a"));
        storage.set(b, Value::from("b"));

        // Reads do not refresh an entry.
        assert_eq!(storage.get(&a), Some(&Value::from("a")));

        storage.set(c, Value::from("c"));

        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get(&a), None);
        assert_eq!(storage.get(&b), Some(&Value::from("b")));
        assert_eq!(storage.get(&c), Some(&Value::from("c")));
    }

    #[test]
    fn setting_refreshes_eviction_order() {
        let mut storage = Storage::new(2);

        let a = Id::from_key("a");
        let b = Id::from_key("b");
        let c = Id::from_key("c");

        storage.set(a, Value::from("a"));
        storage.set(b, Value::from("b"));
        storage.set(a, Value::from("a again"));
        storage.set(c, Value::from("c"));

        assert_eq!(storage.get(&b), None);
        assert_eq!(storage.get(&a), Some(&Value::from("a again")));
    }

    #[test]
    fn iter_older_than_is_exact() {
        let age = Duration::from_secs(3600);
        let past = match Instant::now().checked_sub(age + Duration::from_secs(1)) {
            Some(past) => past,
            // Monotonic clock too young to simulate an aged entry.
            None => return,
        };

        let mut storage = Storage::new(DEFAULT_MAX_ENTRIES);

        let old = Id::from_key("old");
        let fresh = Id::from_key("fresh");

        storage.set_with_time(old, Value::from("old"), past);
        storage.set(fresh, Value::from("fresh"));

        let aged: Vec<_> = storage.iter_older_than(age).collect();
        assert_eq!(aged, vec![(old, Value::from("old"))]);

        // Iterating again yields the same result; iteration is restartable
        // and does not refresh `set_at`.
        assert_eq!(storage.iter_older_than(age).count(), 1);

        // A set refreshes the entry out of the republish window.
        storage.set(old, Value::from("old"));
        assert_eq!(storage.iter_older_than(age).count(), 0);
    }
}
