use lru::LruCache;
use parking_lot::Mutex;
use tracing::warn;

use super::entry::CacheEntry;
use crate::logging::RateLimitedLog;

/// Destination for entries displaced from RAM. The disk tier implements
/// this; tests substitute a recorder.
pub trait EvictionSink {
    fn put_async(&self, key: &str, entry: CacheEntry);
}

/// Size-bounded in-memory tier: an LRU map plus explicit byte accounting.
///
/// All operations take the single inner mutex; eviction hands entries to the
/// sink without doing I/O under the lock (the sink only enqueues).
pub struct RamCache {
    max_bytes: u64,
    inner: Mutex<RamInner>,
}

struct RamInner {
    lru: LruCache<String, RamItem>,
    total_bytes: u64,
}

struct RamItem {
    entry: CacheEntry,
    size: u64,
}

impl RamCache {
    /// `max_bytes == 0` means unbounded.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(RamInner {
                lru: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    /// Hit path lookup: promotes the entry to most-recently-used. Inactive
    /// seeds are reported as misses and keep their LRU position.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        if inner.lru.peek(key)?.entry.inactive {
            return None;
        }
        inner.lru.get(key).map(|item| item.entry.clone())
    }

    /// Lookup without LRU movement; returns inactive seeds too.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().lru.peek(key).map(|item| item.entry.clone())
    }

    pub fn put(
        &self,
        key: &str,
        entry: CacheEntry,
        disk: &dyn EvictionSink,
        overflow_log: &RateLimitedLog,
    ) {
        let size = match entry.encode() {
            Ok(encoded) => encoded.len() as u64,
            Err(err) => {
                warn!(error = %err, key, "failed to serialize cache entry; dropping");
                return;
            }
        };

        // Too big for RAM entirely: admit to disk only.
        if self.max_bytes > 0 && size > self.max_bytes {
            disk.put_async(key, entry);
            return;
        }

        let mut inner = self.inner.lock();

        if let Some(item) = inner.lru.peek(key) {
            let old_size = item.size;
            inner.lru.put(key.to_string(), RamItem { entry, size });
            inner.total_bytes = inner.total_bytes.saturating_sub(old_size) + size;
            return;
        }

        while self.max_bytes > 0 && inner.total_bytes + size > self.max_bytes {
            if !Self::evict_batch_to_disk(&mut inner, disk) {
                break;
            }
            if inner.total_bytes + size <= self.max_bytes {
                break;
            }
            if overflow_log.ready() {
                warn!("ram cache overflow, evicting");
            }
        }

        inner.lru.put(key.to_string(), RamItem { entry, size });
        inner.total_bytes += size;
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.lru.pop(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(item.size);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .lru
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Migrates the least-recently-used ~10% of entries (ceiling, at least
    /// one) to the sink. Returns false when there was nothing to evict.
    fn evict_batch_to_disk(inner: &mut RamInner, disk: &dyn EvictionSink) -> bool {
        let count = inner.lru.len();
        if count == 0 {
            return false;
        }
        let batch = count.div_ceil(10);
        for _ in 0..batch {
            let Some((key, item)) = inner.lru.pop_lru() else {
                return false;
            };
            disk.put_async(&key, item.entry);
            inner.total_bytes = inner.total_bytes.saturating_sub(item.size);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::*;
    use crate::cache::entry::DiscoveredBy;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
    }

    impl EvictionSink for RecordingSink {
        fn put_async(&self, key: &str, _entry: CacheEntry) {
            self.received.lock().push(key.to_string());
        }
    }

    fn entry_with_body(len: usize) -> CacheEntry {
        CacheEntry::from_origin(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(vec![b'x'; len]),
            DiscoveredBy::User,
        )
    }

    fn entry_size(entry: &CacheEntry) -> u64 {
        entry.encode().unwrap().len() as u64
    }

    fn overflow_log() -> RateLimitedLog {
        RateLimitedLog::new(Duration::from_secs(60))
    }

    #[test]
    fn get_promotes_and_accounts_sizes() {
        let cache = RamCache::new(0);
        let sink = RecordingSink::default();
        let log = overflow_log();

        let entry = entry_with_body(10);
        let size = entry_size(&entry);
        cache.put("/a", entry, &sink, &log);
        assert_eq!(cache.total_bytes(), size);
        assert_eq!(cache.key_count(), 1);
        assert!(cache.get("/a").is_some());
        assert!(cache.get("/missing").is_none());
    }

    #[test]
    fn replace_in_place_adjusts_total() {
        let cache = RamCache::new(0);
        let sink = RecordingSink::default();
        let log = overflow_log();

        cache.put("/a", entry_with_body(10), &sink, &log);
        let bigger = entry_with_body(100);
        let bigger_size = entry_size(&bigger);
        cache.put("/a", bigger, &sink, &log);
        assert_eq!(cache.key_count(), 1);
        assert_eq!(cache.total_bytes(), bigger_size);
    }

    #[test]
    fn delete_removes_and_subtracts() {
        let cache = RamCache::new(0);
        let sink = RecordingSink::default();
        let log = overflow_log();

        cache.put("/a", entry_with_body(10), &sink, &log);
        cache.delete("/a");
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.get("/a").is_none());
        // deleting again is a no-op
        cache.delete("/a");
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn oversized_entry_skips_ram_and_goes_to_disk() {
        let cache = RamCache::new(64);
        let sink = RecordingSink::default();
        let log = overflow_log();

        cache.put("/big", entry_with_body(4096), &sink, &log);
        assert_eq!(cache.key_count(), 0);
        assert_eq!(cache.total_bytes(), 0);
        assert_eq!(sink.received.lock().as_slice(), ["/big".to_string()]);
    }

    #[test]
    fn eviction_migrates_least_recently_used_tail() {
        let probe = entry_with_body(64);
        let per_entry = entry_size(&probe);
        // Room for exactly ten entries.
        let cache = RamCache::new(per_entry * 10);
        let sink = RecordingSink::default();
        let log = overflow_log();

        for i in 0..10 {
            cache.put(&format!("/k{i}"), entry_with_body(64), &sink, &log);
        }
        assert_eq!(cache.key_count(), 10);
        assert!(sink.received.lock().is_empty());

        // Touch /k0 so it is no longer the LRU tail.
        assert!(cache.get("/k0").is_some());

        // The 11th insert displaces ceil(10/10) = 1 entry: /k1, the oldest
        // untouched key.
        cache.put("/k10", entry_with_body(64), &sink, &log);
        assert_eq!(sink.received.lock().as_slice(), ["/k1".to_string()]);
        assert_eq!(cache.key_count(), 10);
        assert!(cache.total_bytes() <= per_entry * 10);
        assert!(cache.get("/k0").is_some());
        assert!(cache.get("/k1").is_none());
    }

    #[test]
    fn inactive_entries_are_invisible_to_get_but_not_peek() {
        let cache = RamCache::new(0);
        let sink = RecordingSink::default();
        let log = overflow_log();

        cache.put("/seed", CacheEntry::seed(), &sink, &log);
        assert!(cache.get("/seed").is_none());
        let peeked = cache.peek("/seed").unwrap();
        assert!(peeked.inactive);
    }

    #[test]
    fn keys_returns_snapshot() {
        let cache = RamCache::new(0);
        let sink = RecordingSink::default();
        let log = overflow_log();

        cache.put("/a", entry_with_body(1), &sink, &log);
        cache.put("/b", entry_with_body(1), &sink, &log);
        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["/a".to_string(), "/b".to_string()]);
    }
}
