//! Composite-key cache with per-key build serialization
//!
//! Each key owns a slot guarded by its own mutex. A build for a key runs
//! while holding that slot's lock, so at most one build per key is ever in
//! flight; builds for different keys proceed in parallel.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

#[derive(Debug)]
pub struct KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    slots: DashMap<K, Slot<V>>,
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &K) -> Slot<V> {
        // The map shard lock is released before the slot lock is taken.
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    /// Cached value, if one has been built
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = self.slots.get(key)?.value().clone();
        let guard = slot.lock();
        guard.clone()
    }

    /// Returns the cached value or builds it. With `refresh` the existing
    /// value is discarded and rebuilt. Concurrent callers for the same key
    /// wait for the in-flight build and then share its result.
    pub fn get_or_try_insert_with<E, F>(&self, key: &K, refresh: bool, build: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        if !refresh {
            if let Some(value) = guard.as_ref() {
                return Ok(Arc::clone(value));
            }
        }
        let value = Arc::new(build()?);
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    pub fn insert(&self, key: &K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        *self.slot(key).lock() = Some(Arc::clone(&value));
        value
    }

    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let (_, slot) = self.slots.remove(key)?;
        let value = slot.lock().take();
        value
    }

    /// Drops every entry whose key fails the predicate
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.slots.retain(|key, _| keep(key));
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }
}
