use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{DiskCache, RamCache};
use crate::util::format_bytes;

/// Lock-free response-size counters, updated on every hit/miss response.
pub struct StatsCollector {
    total_responses: AtomicU64,
    total_bytes: AtomicU64,
    min_bytes: AtomicU64,
    max_bytes: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_responses: u64,
    pub total_bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub avg_bytes: u64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            total_responses: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            min_bytes: AtomicU64::new(u64::MAX),
            max_bytes: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, response_bytes: usize) {
        let n = response_bytes as u64;
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
        self.min_bytes.fetch_min(n, Ordering::Relaxed);
        self.max_bytes.fetch_max(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.total_responses.load(Ordering::Relaxed);
        if count == 0 {
            return StatsSnapshot::default();
        }
        let total = self.total_bytes.load(Ordering::Relaxed);
        let mut min = self.min_bytes.load(Ordering::Relaxed);
        if min == u64::MAX {
            min = 0;
        }
        StatsSnapshot {
            total_responses: count,
            total_bytes: total,
            min_bytes: min,
            max_bytes: self.max_bytes.load(Ordering::Relaxed),
            avg_bytes: total / count,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic one-line cache/memory report.
pub fn spawn_stats_loop(
    every: Duration,
    ram: Arc<RamCache>,
    disk: Arc<DiskCache>,
    stats: Arc<StatsCollector>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = ticker.tick() => {}
            }
            log_stats_line(&ram, &disk, &stats);
        }
    })
}

fn log_stats_line(ram: &RamCache, disk: &DiskCache, stats: &StatsCollector) {
    let snapshot = stats.snapshot();
    let paths = cached_paths_count(ram, disk);
    let rss = process_rss_bytes()
        .map(format_bytes)
        .unwrap_or_else(|| "n/a".to_string());

    info!(
        paths,
        ram = %format_bytes(ram.total_bytes()),
        disk = %format_bytes(disk.total_bytes()),
        rss = %rss,
        resp_min = %format_bytes(snapshot.min_bytes),
        resp_avg = %format_bytes(snapshot.avg_bytes),
        resp_max = %format_bytes(snapshot.max_bytes),
        "cache stats"
    );

    if let Some(rollup) = smaps_rollup_bytes() {
        let formatted: Vec<String> = rollup
            .iter()
            .map(|(key, value)| format!("{key}={}", format_bytes(*value)))
            .collect();
        debug!(rollup = %formatted.join(" "), "memory rollup");
    }
}

/// Union size of both key sets, without building a combined map.
fn cached_paths_count(ram: &RamCache, disk: &DiskCache) -> usize {
    let ram_keys = ram.keys();
    let disk_count = disk.key_count();
    let intersect = ram_keys.iter().filter(|key| disk.has_key(key)).count();
    ram_keys.len() + disk_count - intersect
}

/// Best-effort resident set size, from `/proc/self/statm`: the second
/// field is RSS in pages.
#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(rss_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<u64> {
    None
}

/// Splits RSS into anonymous/file/shmem components to tell heap growth from
/// file-backed mappings. Best-effort; values in `smaps_rollup` are in kB.
#[cfg(target_os = "linux")]
fn smaps_rollup_bytes() -> Option<std::collections::BTreeMap<String, u64>> {
    let rollup = std::fs::read_to_string("/proc/self/smaps_rollup").ok()?;
    let mut values = std::collections::BTreeMap::new();
    for line in rollup.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let Some(number) = rest.split_whitespace().next() else {
            continue;
        };
        let Ok(kb) = number.parse::<u64>() else {
            continue;
        };
        if !key.is_empty() {
            values.insert(key.to_string(), kb * 1024);
        }
    }
    if values.is_empty() { None } else { Some(values) }
}

#[cfg(not(target_os = "linux"))]
fn smaps_rollup_bytes() -> Option<std::collections::BTreeMap<String, u64>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collector_snapshots_to_zeroes() {
        let stats = StatsCollector::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn tracks_min_avg_max() {
        let stats = StatsCollector::new();
        stats.observe(100);
        stats.observe(300);
        stats.observe(200);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_responses, 3);
        assert_eq!(snapshot.min_bytes, 100);
        assert_eq!(snapshot.max_bytes, 300);
        assert_eq!(snapshot.avg_bytes, 200);
    }

    #[test]
    fn zero_length_response_moves_min() {
        let stats = StatsCollector::new();
        stats.observe(50);
        stats.observe(0);
        assert_eq!(stats.snapshot().min_bytes, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_is_readable_on_linux() {
        let rss = process_rss_bytes().expect("VmRSS should parse");
        assert!(rss > 0);
    }
}
