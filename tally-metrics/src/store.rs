use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// The lock-free view of a [`MetricStore`].
struct ReadOnly<K, V> {
    map: Arc<HashMap<K, Arc<V>>>,
    /// `true` if the overflow map contains keys that are missing here.
    amended: bool,
}

/// The locked overflow of a [`MetricStore`].
///
/// When present, `map` is a superset of the stable view.
struct Dirty<K, V> {
    map: Option<HashMap<K, Arc<V>>>,
    misses: usize,
}

/// A concurrent map from keys to shared metric instances, optimized for a stable key set.
///
/// Lookups of keys that have been promoted into the stable view never take a lock. New keys go
/// into a locked overflow map which is promoted to the stable view once the number of locked
/// lookups exceeds its size. Entries are never removed, so the returned handles stay valid for the
/// lifetime of the store.
///
/// The factory passed to [`get_or_insert_with`](Self::get_or_insert_with) runs under the overflow
/// lock, so at most one instance is ever constructed per key.
pub struct MetricStore<K, V> {
    read: ArcSwap<ReadOnly<K, V>>,
    dirty: Mutex<Dirty<K, V>>,
}

impl<K, V> MetricStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly {
                map: Arc::new(HashMap::new()),
                amended: false,
            }),
            dirty: Mutex::new(Dirty {
                map: None,
                misses: 0,
            }),
        }
    }

    /// Returns the instance for `key` if it exists.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let read = self.read.load();
        if let Some(value) = read.map.get(key) {
            return Some(Arc::clone(value));
        }
        if !read.amended {
            return None;
        }
        drop(read);

        let mut dirty = self.dirty.lock();
        let read = self.read.load();
        if let Some(value) = read.map.get(key) {
            return Some(Arc::clone(value));
        }
        let value = dirty.map.as_ref().and_then(|map| map.get(key)).cloned();
        self.record_miss(&mut dirty);
        value
    }

    /// Returns the instance for `key`, creating it with `factory` if it does not exist yet.
    ///
    /// Concurrent callers with equal keys always receive the same instance.
    pub fn get_or_insert_with<F>(&self, key: &K, factory: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.read.load().map.get(key) {
            return Arc::clone(value);
        }

        let mut dirty = self.dirty.lock();

        // Another thread may have promoted the overflow while we were waiting for the lock.
        let read = self.read.load_full();
        if let Some(value) = read.map.get(key) {
            return Arc::clone(value);
        }

        let map = dirty.map.get_or_insert_with(|| (*read.map).clone());
        let value = match map.get(key) {
            Some(value) => Arc::clone(value),
            None => {
                let value = Arc::new(factory());
                map.insert(key.clone(), Arc::clone(&value));
                value
            }
        };

        if !read.amended {
            self.read.store(Arc::new(ReadOnly {
                map: Arc::clone(&read.map),
                amended: true,
            }));
        }

        self.record_miss(&mut dirty);
        value
    }

    /// Calls `f` for every entry in the store.
    ///
    /// Entries present when the call starts are visited exactly once. Entries inserted concurrently
    /// may or may not be visited. The callback runs without holding any lock, so it may call back
    /// into the store.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Arc<V>),
    {
        let mut read = self.read.load_full();
        if read.amended {
            let mut dirty = self.dirty.lock();
            read = self.read.load_full();
            if read.amended {
                read = self.promote(&mut dirty);
            }
        }

        for (key, value) in read.map.iter() {
            f(key, value);
        }
    }

    /// Returns the number of entries in the store.
    pub fn len(&self) -> usize {
        let read = self.read.load();
        if !read.amended {
            return read.map.len();
        }
        drop(read);

        let dirty = self.dirty.lock();
        match dirty.map {
            Some(ref map) => map.len(),
            None => self.read.load().map.len(),
        }
    }

    /// Returns `true` if the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_miss(&self, dirty: &mut Dirty<K, V>) {
        dirty.misses += 1;
        let len = dirty.map.as_ref().map_or(0, HashMap::len);
        if dirty.misses > len {
            self.promote(dirty);
        }
    }

    fn promote(&self, dirty: &mut Dirty<K, V>) -> Arc<ReadOnly<K, V>> {
        dirty.misses = 0;
        let read = match dirty.map.take() {
            Some(map) => Arc::new(ReadOnly {
                map: Arc::new(map),
                amended: false,
            }),
            None => {
                let current = self.read.load_full();
                Arc::new(ReadOnly {
                    map: Arc::clone(&current.map),
                    amended: false,
                })
            }
        };
        self.read.store(Arc::clone(&read));
        read
    }
}

impl<K, V> Default for MetricStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for MetricStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn test_get_or_insert_returns_same_instance() {
        let store = MetricStore::<String, AtomicUsize>::new();

        let a = store.get_or_insert_with(&"a".to_owned(), || AtomicUsize::new(1));
        let b = store.get_or_insert_with(&"a".to_owned(), || AtomicUsize::new(2));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.load(Ordering::Relaxed), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let store = MetricStore::<u32, ()>::new();
        assert!(store.get(&1).is_none());

        store.get_or_insert_with(&1, || ());
        assert!(store.get(&1).is_some());
        assert!(store.get(&2).is_none());
    }

    #[test]
    fn test_promotion_keeps_entries() {
        let store = MetricStore::<u32, u32>::new();
        for i in 0..100 {
            store.get_or_insert_with(&i, || i * 2);
        }
        // Repeated lookups promote the overflow into the stable view.
        for _ in 0..3 {
            for i in 0..100 {
                assert_eq!(*store.get_or_insert_with(&i, || 0), i * 2);
            }
        }

        assert!(!store.read.load().amended);
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_concurrent_insert_runs_factory_once() {
        const THREADS: usize = 8;
        const KEYS: usize = 64;

        let store = MetricStore::<usize, usize>::new();
        let constructed = AtomicUsize::new(0);

        let results: Vec<Vec<Arc<usize>>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..KEYS)
                            .map(|key| {
                                store.get_or_insert_with(&key, || {
                                    constructed.fetch_add(1, Ordering::Relaxed);
                                    key
                                })
                            })
                            .collect()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(constructed.load(Ordering::Relaxed), KEYS);
        for key in 0..KEYS {
            let first = &results[0][key];
            for result in &results[1..] {
                assert!(Arc::ptr_eq(first, &result[key]));
            }
        }
    }

    #[test]
    fn test_for_each_visits_every_key_once() {
        let store = MetricStore::<u64, u64>::new();
        for i in 0..1000 {
            store.get_or_insert_with(&i, || i);
        }

        let mut seen = StdHashMap::new();
        store.for_each(|key, value| {
            assert_eq!(key, &**value);
            *seen.entry(*key).or_insert(0) += 1;
        });

        assert_eq!(seen.len(), 1000);
        assert!(seen.values().all(|count| *count == 1));
    }

    #[test]
    fn test_for_each_during_inserts() {
        let store = MetricStore::<u64, u64>::new();
        for i in 0..100 {
            store.get_or_insert_with(&i, || i);
        }

        thread::scope(|s| {
            s.spawn(|| {
                for i in 100..1000 {
                    store.get_or_insert_with(&i, || i);
                }
            });

            let mut visited = Vec::new();
            store.for_each(|key, _| visited.push(*key));
            visited.sort_unstable();

            let preexisting = visited.iter().filter(|key| **key < 100).count();
            assert_eq!(preexisting, 100);

            let total = visited.len();
            visited.dedup();
            assert_eq!(visited.len(), total);
        });

        assert_eq!(store.len(), 1000);
    }

    #[test]
    fn test_for_each_may_reenter() {
        let store = MetricStore::<u32, u32>::new();
        store.get_or_insert_with(&1, || 1);

        store.for_each(|key, _| {
            store.get_or_insert_with(&(key + 1), || key + 1);
        });

        assert_eq!(store.len(), 2);
    }
}
