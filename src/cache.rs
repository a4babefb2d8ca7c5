//! Byte-budgeted LRU content cache.
//!
//! Ordering is provided by the `lru` crate's intrusive linked-hashmap; this module layers the
//! byte-budget eviction and the shared-read/exclusive-write discipline on top, per the
//! resolution spec.md §9 permits: promotion on a read hit takes the writer path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use lru::LruCache;
use parking_lot::RwLock;

use crate::logger::Logger;

/// A cached file's content and metadata. Content is reference-counted so a cache hit hands the
/// caller a cheap clone rather than copying bytes.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// File content.
    pub bytes: Arc<[u8]>,
    /// Resolved mime type.
    pub mime: String,
    /// File's last-modified time, as read at the time of insertion.
    pub last_modified: SystemTime,
}

/// A point-in-time snapshot of cache occupancy.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Sum of all cached entries' content lengths.
    pub current_size: u64,
    /// Configured byte budget.
    pub max_size: u64,
    /// Number of entries currently cached.
    pub item_count: usize,
    /// Configured max age, in seconds. Not enforced on read (spec.md §9).
    pub max_age: u64,
}

struct Inner {
    entries: LruCache<PathBuf, CacheEntry>,
    current_size: u64,
}

/// Shared-read / exclusive-write LRU cache, keyed by absolute file path.
pub struct Cache {
    inner: RwLock<Inner>,
    max_size: u64,
    max_age_seconds: RwLock<u64>,
}

impl Cache {
    /// Creates a cache with the given byte budget and observability-only max age.
    pub fn new(max_size: u64, max_age_seconds: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                // Unbounded by count; eviction is driven purely by `current_size` vs `max_size`.
                entries: LruCache::unbounded(),
                current_size: 0,
            }),
            max_size,
            max_age_seconds: RwLock::new(max_age_seconds),
        }
    }

    /// On hit, promotes `key` to most-recently-used and returns a clone of its entry.
    pub fn get(&self, key: &PathBuf) -> Option<CacheEntry> {
        let mut inner = self.inner.write();
        inner.entries.get(key).cloned()
    }

    /// Inserts `entry` for `key`, evicting least-recently-used entries until the budget is
    /// respected. A no-op if `entry.bytes.len() > max_size`.
    pub fn put(&self, key: PathBuf, entry: CacheEntry) {
        let len = entry.bytes.len() as u64;
        if len > self.max_size {
            return;
        }

        let mut inner = self.inner.write();

        if let Some(old) = inner.entries.pop(&key) {
            inner.current_size -= old.bytes.len() as u64;
        }

        while inner.current_size + len > self.max_size {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.current_size -= evicted.bytes.len() as u64;
                }
                None => break,
            }
        }

        if inner.current_size + len > self.max_size {
            // Budget cannot be satisfied even with an empty cache (shouldn't happen given the
            // len check above, but roll back cleanly rather than violate the invariant).
            Logger::global().warning("cache insert could not satisfy byte budget, rolled back");
            return;
        }

        inner.entries.put(key, entry);
        inner.current_size += len;
    }

    /// Removes `key` if present.
    pub fn remove(&self, key: &PathBuf) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.entries.pop(key) {
            inner.current_size -= old.bytes.len() as u64;
        }
    }

    /// Empties the cache.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.current_size = 0;
    }

    /// Current occupied bytes.
    pub fn size(&self) -> u64 {
        self.inner.read().current_size
    }

    /// Current entry count.
    pub fn count(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Point-in-time occupancy snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            current_size: inner.current_size,
            max_size: self.max_size,
            item_count: inner.entries.len(),
            max_age: *self.max_age_seconds.read(),
        }
    }

    /// Configured max age, in seconds.
    pub fn max_age(&self) -> u64 {
        *self.max_age_seconds.read()
    }

    /// Updates the configured max age. Purely observational; never consulted on read.
    pub fn set_max_age(&self, seconds: u64) {
        *self.max_age_seconds.write() = seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(data: &[u8]) -> CacheEntry {
        CacheEntry {
            bytes: Arc::from(data.to_vec().into_boxed_slice()),
            mime: "text/plain".to_string(),
            last_modified: SystemTime::now(),
        }
    }

    #[test]
    fn get_miss_returns_none() {
        let cache = Cache::new(1024, 60);
        assert!(cache.get(&PathBuf::from("/a")).is_none());
    }

    #[test]
    fn put_then_get_hits_and_promotes() {
        let cache = Cache::new(1024, 60);
        cache.put(PathBuf::from("/a"), entry(b"hello"));
        let hit = cache.get(&PathBuf::from("/a")).unwrap();
        assert_eq!(&*hit.bytes, b"hello");
        assert_eq!(cache.size(), 5);
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn oversized_entry_is_a_noop() {
        let cache = Cache::new(4, 60);
        cache.put(PathBuf::from("/a"), entry(b"hello"));
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn eviction_respects_budget_and_picks_lru() {
        let cache = Cache::new(10, 60);
        cache.put(PathBuf::from("/a"), entry(b"12345")); // 5 bytes
        cache.put(PathBuf::from("/b"), entry(b"67890")); // 5 bytes, total 10
        assert_eq!(cache.count(), 2);

        // touch /a so /b becomes LRU
        cache.get(&PathBuf::from("/a"));

        cache.put(PathBuf::from("/c"), entry(b"abcde")); // forces eviction of /b
        assert!(cache.get(&PathBuf::from("/b")).is_none());
        assert!(cache.get(&PathBuf::from("/a")).is_some());
        assert!(cache.get(&PathBuf::from("/c")).is_some());
        assert!(cache.size() <= 10);
    }

    #[test]
    fn inserting_n_plus_one_evicts_exactly_one() {
        let cache = Cache::new(30, 60); // max_size/n == 10 for n=3
        cache.put(PathBuf::from("/1"), entry(&[0u8; 10]));
        cache.put(PathBuf::from("/2"), entry(&[0u8; 10]));
        cache.put(PathBuf::from("/3"), entry(&[0u8; 10]));
        assert_eq!(cache.count(), 3);

        cache.put(PathBuf::from("/4"), entry(&[0u8; 10]));
        assert_eq!(cache.count(), 3);
        assert!(cache.get(&PathBuf::from("/1")).is_none());
    }

    #[test]
    fn remove_and_clear() {
        let cache = Cache::new(1024, 60);
        cache.put(PathBuf::from("/a"), entry(b"hello"));
        cache.remove(&PathBuf::from("/a"));
        assert_eq!(cache.count(), 0);

        cache.put(PathBuf::from("/b"), entry(b"world"));
        cache.clear();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn max_age_is_observational_only() {
        let cache = Cache::new(1024, 60);
        assert_eq!(cache.max_age(), 60);
        cache.set_max_age(120);
        assert_eq!(cache.max_age(), 120);
        assert_eq!(cache.stats().max_age, 120);
    }
}
