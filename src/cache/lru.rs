use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use log::{trace, warn};

use crate::sync::lock;

use super::{CacheError, CacheSize, Compression};

#[derive(Debug)]
struct Entry {
    blob: Vec<u8>,
    stamp: u64,
}

/// Recency bookkeeping. `order` maps access stamps to keys, oldest first.
#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    clock: u64,
    bytes: usize,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &str) {
        let stamp = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.stamp);
            entry.stamp = stamp;
            self.order.insert(stamp, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        self.bytes -= entry.blob.len();
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.bytes -= entry.blob.len();
        }
        Some(key)
    }
}

/// Bounded key to blob store with least-recently-used eviction.
#[derive(Debug)]
pub struct LruCache {
    capacity: usize,
    compression: Compression,
    inner: Mutex<Inner>,
}

impl LruCache {
    /// Creates a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize, compression: Compression) -> Self {
        Self {
            capacity: capacity.max(1),
            compression,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Returns the blob stored under `key` and marks it most recently used.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = lock(&self.inner);
        let stored = &inner.entries.get(key)?.blob;

        match self.compression.decompress(stored) {
            Ok(blob) => {
                inner.touch(key);
                Some(blob)
            }
            Err(e) => {
                warn!("dropping unreadable cache entry {key}: {e}");
                inner.remove(key);
                None
            }
        }
    }

    /// Inserts or replaces `key`, then evicts the least recently used entry if the
    /// cache went over capacity.
    pub fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        let stored = self
            .compression
            .compress(blob)
            .map_err(CacheError::Compress)?;

        let mut inner = lock(&self.inner);
        let stamp = inner.tick();
        inner.bytes += stored.len();
        if let Some(old) = inner.entries.insert(key.to_string(), Entry { blob: stored, stamp }) {
            inner.order.remove(&old.stamp);
            inner.bytes -= old.blob.len();
        }
        inner.order.insert(stamp, key.to_string());

        if inner.entries.len() > self.capacity {
            if let Some(evicted) = inner.evict_oldest() {
                trace!("evicted {evicted}");
            }
        }
        Ok(())
    }

    /// Checks for `key` without refreshing its recency.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> CacheSize {
        let inner = lock(&self.inner);
        CacheSize {
            count: inner.entries.len(),
            bytes: inner.bytes,
        }
    }

    pub fn clear(&self) {
        *lock(&self.inner) = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn cache(capacity: usize) -> LruCache {
        LruCache::new(capacity, Compression::None)
    }

    #[test]
    fn get_returns_latest_put() {
        let cache = cache(4);
        cache.put("A.nc", b"one").unwrap();
        cache.put("A.nc", b"two").unwrap();

        assert_eq!(cache.get("A.nc"), Some(b"two".to_vec()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("B.nc"), None);
    }

    #[test]
    fn overflow_evicts_first_inserted() {
        let cache = cache(3);
        for key in ["A", "B", "C", "D"] {
            cache.put(key, key.as_bytes()).unwrap();
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("A"), None);
        for key in ["B", "C", "D"] {
            assert_eq!(cache.get(key), Some(key.as_bytes().to_vec()));
        }
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = cache(2);
        cache.put("A", b"a").unwrap();
        cache.put("B", b"b").unwrap();
        assert!(cache.get("A").is_some());
        cache.put("C", b"c").unwrap();

        assert!(cache.contains("A"));
        assert!(!cache.contains("B"));
        assert!(cache.contains("C"));
    }

    #[test]
    fn overwrite_refreshes_recency() {
        let cache = cache(2);
        cache.put("A", b"a").unwrap();
        cache.put("B", b"b").unwrap();
        cache.put("A", b"a2").unwrap();
        cache.put("C", b"c").unwrap();

        assert_eq!(cache.get("A"), Some(b"a2".to_vec()));
        assert!(!cache.contains("B"));
    }

    #[test]
    fn contains_does_not_refresh() {
        let cache = cache(2);
        cache.put("A", b"a").unwrap();
        cache.put("B", b"b").unwrap();
        assert!(cache.contains("A"));
        cache.put("C", b"c").unwrap();

        assert!(!cache.contains("A"));
    }

    #[test]
    fn size_tracks_stored_bytes() {
        let cache = cache(2);
        assert_eq!(cache.size().to_string(), "0 item(s)   0 B");

        cache.put("A", &[0; 10]).unwrap();
        cache.put("B", &[0; 20]).unwrap();
        cache.put("A", &[0; 5]).unwrap();
        assert_eq!(cache.size(), CacheSize { count: 2, bytes: 25 });

        cache.put("C", &[0; 1]).unwrap();
        assert_eq!(cache.size(), CacheSize { count: 2, bytes: 6 });
        assert_eq!(cache.size().to_string(), "2 item(s)   6 B");

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), CacheSize::default());
    }

    #[test]
    fn compression_is_transparent() {
        let cache = LruCache::new(2, Compression::zlib());
        let blob = vec![42u8; 4096];
        cache.put("A", &blob).unwrap();
        cache.put("B", b"b").unwrap();
        assert_eq!(cache.get("A"), Some(blob));

        assert!(cache.size().bytes < 4096);

        cache.put("C", b"c").unwrap();
        assert!(cache.contains("A"));
        assert!(!cache.contains("B"));
    }

    #[test]
    fn zero_capacity_holds_one() {
        let cache = cache(0);
        cache.put("A", b"a").unwrap();
        cache.put("B", b"b").unwrap();

        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("B"));
    }

    #[test]
    fn concurrent_puts_respect_capacity() {
        let cache = Arc::new(cache(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("{t}-{i}");
                        cache.put(&key, key.as_bytes()).unwrap();
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 8);
    }
}
