use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::{CacheEntry, now_unix};
use super::ram::EvictionSink;
use crate::logging::RateLimitedLog;

const ENTRY_PREFIX: &str = "e:";
const META_PREFIX: &str = "m:";
const OP_QUEUE_CAPACITY: usize = 1024;
const OVERFLOW_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Persistent size-bounded tier over a sled tree.
///
/// Two keyspaces: `e:<key>` holds the serialized entry, `m:<key>` its
/// metadata. An in-memory index mirrors the metadata so eviction decisions
/// never scan the store. All mutations flow through a bounded channel
/// consumed by a single writer task, which makes per-key and cross-key
/// mutation order well defined without per-key locks; reads go straight to
/// sled.
pub struct DiskCache {
    shared: Arc<DiskShared>,
    tx: mpsc::Sender<DiskOp>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

struct DiskShared {
    max_bytes: u64,
    db: sled::Db,
    index: Mutex<DiskIndex>,
    overflow_log: RateLimitedLog,
}

#[derive(Default)]
struct DiskIndex {
    entries: HashMap<String, DiskMeta>,
    total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DiskMeta {
    size: u64,
    last_access: u64,
}

enum DiskOp {
    Put { key: String, entry: CacheEntry },
    Touch { key: String },
    Delete { key: String },
    Shutdown,
}

impl DiskCache {
    /// Opens (and with `wipe` clears) the store, rebuilds the metadata
    /// index, and starts the writer task. The service opens with
    /// `wipe = true` so every process start presents an empty logical cache.
    pub fn open(path: &Path, max_bytes: u64, wipe: bool) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open cache store at {}", path.display()))?;
        if wipe {
            db.clear().context("failed to clear cache store")?;
        }

        let shared = Arc::new(DiskShared {
            max_bytes,
            db,
            index: Mutex::new(DiskIndex::default()),
            overflow_log: RateLimitedLog::new(OVERFLOW_LOG_INTERVAL),
        });
        shared.load_index();

        let (tx, rx) = mpsc::channel(OP_QUEUE_CAPACITY);
        let writer = tokio::task::spawn_blocking({
            let shared = shared.clone();
            move || writer_loop(shared, rx)
        });

        Ok(Self {
            shared,
            tx,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Direct store read, no LRU effect. Returns inactive seeds.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let data = match self.shared.db.get(entry_key(key)) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, key, "disk cache read failed");
                return None;
            }
        };
        match CacheEntry::decode(&data) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, key, "undecodable disk cache entry");
                None
            }
        }
    }

    /// Serving-path lookup: refreshes the entry's last access and schedules
    /// the metadata rewrite. Inactive seeds are reported as misses.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.peek(key)?;
        if entry.inactive {
            return None;
        }
        let known = {
            let mut index = self.shared.index.lock();
            match index.entries.get_mut(key) {
                Some(meta) => {
                    meta.last_access = now_unix();
                    true
                }
                None => false,
            }
        };
        if known {
            self.enqueue(DiskOp::Touch {
                key: key.to_string(),
            });
        }
        Some(entry)
    }

    pub fn put_async(&self, key: &str, entry: CacheEntry) {
        self.enqueue(DiskOp::Put {
            key: key.to_string(),
            entry,
        });
    }

    /// Removal is awaited onto the queue (never dropped): invalidation after
    /// a non-2xx revalidation is a correctness requirement, not best-effort.
    pub async fn delete(&self, key: &str) {
        if self
            .tx
            .send(DiskOp::Delete {
                key: key.to_string(),
            })
            .await
            .is_err()
        {
            warn!(key, "disk cache writer gone; delete dropped");
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.shared.index.lock().entries.keys().cloned().collect()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.shared.index.lock().entries.contains_key(key)
    }

    pub fn key_count(&self) -> usize {
        self.shared.index.lock().entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.index.lock().total_bytes
    }

    /// Drains queued operations, flushes sled, and stops the writer.
    pub async fn close(&self) {
        let _ = self.tx.send(DiskOp::Shutdown).await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    fn enqueue(&self, op: DiskOp) {
        if let Err(err) = self.tx.try_send(op) {
            match err {
                mpsc::error::TrySendError::Full(op) => {
                    if self.shared.overflow_log.ready() {
                        warn!(op = op.kind(), "disk cache write queue full; dropping");
                    }
                }
                mpsc::error::TrySendError::Closed(op) => {
                    debug!(op = op.kind(), "disk cache writer gone; dropping");
                }
            }
        }
    }
}

impl EvictionSink for DiskCache {
    fn put_async(&self, key: &str, entry: CacheEntry) {
        DiskCache::put_async(self, key, entry);
    }
}

impl DiskOp {
    fn kind(&self) -> &'static str {
        match self {
            DiskOp::Put { .. } => "put",
            DiskOp::Touch { .. } => "touch",
            DiskOp::Delete { .. } => "delete",
            DiskOp::Shutdown => "shutdown",
        }
    }
}

fn writer_loop(shared: Arc<DiskShared>, mut rx: mpsc::Receiver<DiskOp>) {
    while let Some(op) = rx.blocking_recv() {
        match op {
            DiskOp::Put { key, entry } => shared.apply_put(&key, entry),
            DiskOp::Touch { key } => shared.apply_touch(&key),
            DiskOp::Delete { key } => shared.apply_delete(&key),
            DiskOp::Shutdown => break,
        }
    }
    if let Err(err) = shared.db.flush() {
        warn!(error = %err, "failed to flush cache store on shutdown");
    }
}

impl DiskShared {
    /// Rebuilds the in-memory index from the `m:` keyspace. Undecodable
    /// metadata records are skipped; `e:` orphans are left behind and get
    /// overwritten or evicted on the key's next write.
    fn load_index(&self) {
        let mut entries = HashMap::new();
        let mut total_bytes = 0u64;
        for item in self.db.scan_prefix(META_PREFIX.as_bytes()) {
            let (raw_key, raw_meta) = match item {
                Ok(kv) => kv,
                Err(err) => {
                    warn!(error = %err, "disk cache index scan failed");
                    break;
                }
            };
            let Ok(key) = std::str::from_utf8(&raw_key[META_PREFIX.len()..]) else {
                continue;
            };
            let Ok(meta) = bincode::deserialize::<DiskMeta>(&raw_meta) else {
                debug!(key, "skipping undecodable cache metadata");
                continue;
            };
            total_bytes += meta.size;
            entries.insert(key.to_string(), meta);
        }

        let mut index = self.index.lock();
        index.entries = entries;
        index.total_bytes = total_bytes;
    }

    fn apply_put(&self, key: &str, entry: CacheEntry) {
        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, key, "failed to serialize disk cache entry");
                return;
            }
        };
        let size = encoded.len() as u64;

        // Admission fails for entries bigger than the whole tier. Any stale
        // on-disk copy is removed so the tiers cannot keep diverging copies.
        if self.max_bytes > 0 && size > self.max_bytes {
            if self.overflow_log.ready() {
                warn!(key, size, "entry exceeds disk cache capacity; not admitted");
            }
            self.apply_delete(key);
            return;
        }

        let meta = DiskMeta {
            size,
            last_access: now_unix(),
        };
        let Ok(meta_bytes) = bincode::serialize(&meta) else {
            return;
        };

        let over_budget = {
            let mut index = self.index.lock();
            if let Some(old) = index.entries.insert(key.to_string(), meta) {
                index.total_bytes = index.total_bytes.saturating_sub(old.size);
            }
            index.total_bytes += size;
            self.max_bytes > 0 && index.total_bytes > self.max_bytes
        };

        let mut batch = sled::Batch::default();
        batch.insert(entry_key(key).into_bytes(), encoded);
        batch.insert(meta_key(key).into_bytes(), meta_bytes);
        if let Err(err) = self.db.apply_batch(batch) {
            // The index now over-reports until the next successful write of
            // this key; the cache degrades but the process keeps serving.
            warn!(error = %err, key, "disk cache write failed");
        }

        if over_budget {
            self.evict_some();
        }
    }

    fn apply_touch(&self, key: &str) {
        let meta = {
            let index = self.index.lock();
            match index.entries.get(key) {
                Some(meta) => *meta,
                None => return,
            }
        };
        let Ok(meta_bytes) = bincode::serialize(&meta) else {
            return;
        };
        if let Err(err) = self.db.insert(meta_key(key).into_bytes(), meta_bytes) {
            warn!(error = %err, key, "disk cache touch failed");
        }
    }

    fn apply_delete(&self, key: &str) {
        let mut batch = sled::Batch::default();
        batch.remove(entry_key(key).into_bytes());
        batch.remove(meta_key(key).into_bytes());
        if let Err(err) = self.db.apply_batch(batch) {
            warn!(error = %err, key, "disk cache delete failed");
        }

        let mut index = self.index.lock();
        if let Some(meta) = index.entries.remove(key) {
            index.total_bytes = index.total_bytes.saturating_sub(meta.size);
        }
    }

    /// Deletes the least-recently-accessed ~10% of keys (ceiling, at least
    /// one). The index is copied out and sorted on demand; evictions are
    /// batched, so the sort cost stays off the serving path.
    fn evict_some(&self) {
        let mut candidates: Vec<(String, u64)> = {
            let index = self.index.lock();
            index
                .entries
                .iter()
                .map(|(key, meta)| (key.clone(), meta.last_access))
                .collect()
        };
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let batch = candidates.len().div_ceil(10);
        for (key, _) in candidates.into_iter().take(batch) {
            self.apply_delete(&key);
        }
    }
}

fn entry_key(key: &str) -> String {
    format!("{ENTRY_PREFIX}{key}")
}

fn meta_key(key: &str) -> String {
    format!("{META_PREFIX}{key}")
}
