//! Thread-safe map with atomic get-or-create
//!
//! A mutex-guarded hash map; values are cheap clones (`Arc`s throughout the
//! engine). `get_or_create` runs the factory under the write lock so two
//! concurrent callers for an absent key never both run it.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// Generic concurrent map.
pub struct CMap<K, V> {
    data: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for CMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        self.data.write().insert(key, value);
    }

    /// Remove an entry, returning it so the caller can tear it down.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.data.write().remove(key)
    }

    /// Return the value for `key`, inserting the factory's result first if
    /// the key is absent. The factory runs under the write lock.
    pub fn get_or_create(&self, key: K, factory: impl FnOnce() -> V) -> V {
        let mut data = self.data.write();
        data.entry(key).or_insert_with(factory).clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.data.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.data.read().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Apply `f` to every entry under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for (k, v) in self.data.read().iter() {
            f(k, v);
        }
    }
}
