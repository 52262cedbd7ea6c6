//! Sharded per-key state storage.
//!
//! Backs the rate limiter's per-key windows. Each key lives in one DashMap
//! shard, so two requests for the same key are serialized by the shard lock
//! while unrelated keys proceed in parallel.

use crate::application::ports::Storage;
use ahash::RandomState;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Thread-safe sharded storage backed by DashMap with an ahash hasher.
#[derive(Debug)]
pub struct ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    map: DashMap<K, V, RandomState>,
}

impl<K, V> ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty storage.
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
        }
    }
}

impl<K, V> Default for ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Storage<K, V> for ShardedStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + Debug,
    V: Send + Sync + Debug,
{
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R,
    {
        let mut value_ref = self.map.entry(key).or_insert_with(factory);
        accessor(&mut value_ref)
    }

    fn with_entry<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        self.map.get(key).map(|value_ref| accessor(&value_ref))
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.map.retain(f);
    }
}

// Shared handles are what the limiters actually hold
impl<K, V> Storage<K, V> for Arc<ShardedStorage<K, V>>
where
    K: Hash + Eq + Clone + Send + Sync + Debug,
    V: Send + Sync + Debug,
{
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R,
    {
        (**self).with_entry_mut(key, factory, accessor)
    }

    fn with_entry<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        (**self).with_entry(key, accessor)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        (**self).retain(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_with_entry_mut_creates_once() {
        let storage: ShardedStorage<String, u32> = ShardedStorage::new();

        let first = storage.with_entry_mut("k".to_string(), || 10, |v| {
            *v += 1;
            *v
        });
        let second = storage.with_entry_mut("k".to_string(), || 0, |v| {
            *v += 1;
            *v
        });

        assert_eq!(first, 11);
        assert_eq!(second, 12);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_with_entry_does_not_create() {
        let storage: ShardedStorage<String, u32> = ShardedStorage::new();
        assert_eq!(storage.with_entry(&"missing".to_string(), |v| *v), None);
        assert!(storage.is_empty());

        storage.with_entry_mut("present".to_string(), || 5, |_| ());
        assert_eq!(storage.with_entry(&"present".to_string(), |v| *v), Some(5));
    }

    #[test]
    fn test_retain_filters_entries() {
        let storage: ShardedStorage<String, u32> = ShardedStorage::new();
        for i in 0..10 {
            storage.with_entry_mut(format!("k{}", i), || i, |_| ());
        }

        storage.retain(|_, v| *v % 2 == 0);
        assert_eq!(storage.len(), 5);
        assert_eq!(storage.with_entry(&"k1".to_string(), |v| *v), None);
        assert_eq!(storage.with_entry(&"k4".to_string(), |v| *v), Some(4));
    }

    #[test]
    fn test_concurrent_updates_to_one_key_are_serialized() {
        let storage: Arc<ShardedStorage<&'static str, u64>> = Arc::new(ShardedStorage::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let storage = Arc::clone(&storage);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    storage.with_entry_mut("counter", || 0, |v| *v += 1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.with_entry(&"counter", |v| *v), Some(8000));
    }
}
