use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, HeaderValue};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::cache::entry::RefreshCause;
use crate::cache::{DiskCache, RamCache};
use crate::logging::RateLimitedLog;
use crate::proxy::origin::{OriginClient, StatusKind};

/// Global cap on concurrent background fetches, shared by hit-driven
/// refreshes and warmup. Saturation drops new work instead of queueing it:
/// overload should degrade freshness, not grow a backlog.
pub const MAX_BACKGROUND_FETCHES: usize = 32;

/// Per-task deadline for any background fetch.
pub const BACKGROUND_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateOutcome {
    /// Body hash unchanged; nothing written, no LRU movement anywhere.
    Unchanged,
    /// Content changed and both tiers were updated.
    Updated,
    /// Origin answered non-2xx; the key was removed from both tiers.
    IgnoredStatus,
    /// Response stopped carrying a dynamic marker; removed from both tiers.
    IgnoredCacheControl,
    /// Transport or read failure; the cached entry is left untouched.
    Error,
}

/// Shared background refresher behind the SWR serving path and warmup.
pub struct Revalidator {
    origin: OriginClient,
    ram: Arc<RamCache>,
    disk: Arc<DiskCache>,
    overflow_log: Arc<RateLimitedLog>,
    permits: Arc<Semaphore>,
}

impl Revalidator {
    pub fn new(
        origin: OriginClient,
        ram: Arc<RamCache>,
        disk: Arc<DiskCache>,
        overflow_log: Arc<RateLimitedLog>,
    ) -> Self {
        Self {
            origin,
            ram,
            disk,
            overflow_log,
            permits: Arc::new(Semaphore::new(MAX_BACKGROUND_FETCHES)),
        }
    }

    /// Fire-and-forget refresh for the serving path. Returns false when the
    /// global cap is saturated; the next stale hit will try again.
    pub fn kick(self: &Arc<Self>, key: &str, query: Option<&str>, cause: RefreshCause) -> bool {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return false;
        };
        let this = self.clone();
        let key = key.to_string();
        let query = query.map(str::to_string);
        tokio::spawn(async move {
            let _permit = permit;
            let _ = tokio::time::timeout(
                BACKGROUND_DEADLINE,
                this.revalidate_once(&key, query.as_deref(), cause),
            )
            .await;
        });
        true
    }

    /// Warmup entry point: the caller throttles per rule; this still takes
    /// the global cap (returning None when saturated) and applies the
    /// deadline.
    pub async fn run_guarded(&self, key: &str, cause: RefreshCause) -> Option<RevalidateOutcome> {
        let Ok(_permit) = self.permits.try_acquire() else {
            return None;
        };
        match tokio::time::timeout(BACKGROUND_DEADLINE, self.revalidate_once(key, None, cause))
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(_) => Some(RevalidateOutcome::Error),
        }
    }

    pub async fn revalidate_once(
        &self,
        key: &str,
        query: Option<&str>,
        cause: RefreshCause,
    ) -> RevalidateOutcome {
        let path_and_query = match query {
            Some(q) if !q.is_empty() => format!("{key}?{q}"),
            _ => key.to_string(),
        };

        let fetched = match self.origin.fetch(&path_and_query, Some(&debug_headers())).await {
            Ok(fetched) => fetched,
            Err(err) => {
                debug!(error = %err, key, "background fetch failed; keeping cached entry");
                return RevalidateOutcome::Error;
            }
        };

        if fetched.status_kind == StatusKind::IgnoreByStatus {
            self.invalidate(key).await;
            return RevalidateOutcome::IgnoredStatus;
        }
        if !fetched.cacheable {
            // The page stopped advertising itself as dynamic; it no longer
            // belongs in this cache.
            self.invalidate(key).await;
            return RevalidateOutcome::IgnoredCacheControl;
        }

        let mut entry = fetched.entry;
        if let Some(current) = self.ram.peek(key).or_else(|| self.disk.peek(key)) {
            // Seeds never count as current content; they must be replaced.
            if !current.inactive && current.hash32 == entry.hash32 {
                return RevalidateOutcome::Unchanged;
            }
            entry.discovered_by = current.discovered_by;
        }
        entry.mark_revalidated(cause);

        self.ram
            .put(key, entry.clone(), self.disk.as_ref(), &self.overflow_log);
        self.disk.put_async(key, entry);
        RevalidateOutcome::Updated
    }

    async fn invalidate(&self, key: &str) {
        self.ram.delete(key);
        self.disk.delete(key).await;
    }
}

fn debug_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let stamp = humantime::format_rfc3339_nanos(SystemTime::now()).to_string();
    if let Ok(value) = HeaderValue::from_str(&stamp) {
        headers.insert("x-dbg-revalidate-at", value);
    }
    headers
}
