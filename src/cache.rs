use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// LRU cache whose entries also expire after a fixed time-to-live.
///
/// Expired entries are dropped lazily on lookup; capacity eviction is handled by the
/// underlying `LruCache`.
pub struct ExpiringLru<K: Hash + Eq, V> {
    cache: Arc<Mutex<LruCache<K, (Instant, V)>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> ExpiringLru<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(cap))),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some((expires, value)) if *expires > now => Some(value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&self, key: K, value: V, now: Instant) {
        let mut cache = self.cache.lock().unwrap();
        cache.put(key, (now + self.ttl, value));
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock().unwrap();
        cache.pop(key).map(|(_, value)| value)
    }

    /// Drop every entry.
    pub fn purge(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-size rolling buffer. Writes overwrite the oldest slot once full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: Vec<Option<T>>,
    cursor: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: vec![None; capacity],
            cursor: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items[self.cursor] = Some(item);
        self.cursor = (self.cursor + 1) % self.items.len();
    }

    /// Contents ordered oldest to newest, skipping slots never written.
    pub fn to_vec(&self) -> Vec<T> {
        let (newer, older) = self.items.split_at(self.cursor);
        older.iter().chain(newer.iter()).flatten().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }
}
