use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::cache::entry::RefreshCause;
use crate::cache::{DiskCache, RamCache};
use crate::revalidate::{RevalidateOutcome, Revalidator};
use crate::rules::Rule;

/// Spawns the periodic warmup task for one rule carrying a warmup
/// descriptor. Each tick revalidates every known key matching the rule,
/// throttled by the rule's own in-flight cap.
pub fn spawn(
    rule: Rule,
    ram: Arc<RamCache>,
    disk: Arc<DiskCache>,
    revalidator: Arc<Revalidator>,
    log_warmup: bool,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(warmup) = rule.warmup.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(warmup.run_every);
        // interval fires immediately; warmup waits one full period first
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = ticker.tick() => {}
            }
            let summary =
                run_pass(&rule, warmup.max_in_flight, &ram, &disk, &revalidator).await;
            if log_warmup {
                summary.log();
            }
        }
    })
}

async fn run_pass(
    rule: &Rule,
    max_in_flight: usize,
    ram: &Arc<RamCache>,
    disk: &Arc<DiskCache>,
    revalidator: &Arc<Revalidator>,
) -> WarmupSummary {
    let started = Instant::now();

    // Union of both tiers, deduplicated and sorted; inactive seeds included.
    let mut keys: BTreeSet<String> = ram.keys().into_iter().collect();
    keys.extend(disk.keys());
    let keys: Vec<String> = keys
        .into_iter()
        .filter(|key| rule.matches(key))
        .collect();

    let throttle = Arc::new(Semaphore::new(max_in_flight));
    let mut jobs = JoinSet::new();
    for key in keys {
        let Ok(permit) = throttle.clone().acquire_owned().await else {
            break;
        };
        let revalidator = revalidator.clone();
        jobs.spawn(async move {
            let _permit = permit;
            let job_started = Instant::now();
            let outcome = revalidator.run_guarded(&key, RefreshCause::Warmup).await;
            (outcome, job_started.elapsed())
        });
    }

    let mut summary = WarmupSummary::default();
    while let Some(result) = jobs.join_next().await {
        match result {
            Ok((outcome, elapsed)) => summary.record(outcome, elapsed),
            Err(err) => {
                debug!(error = %err, "warmup job panicked");
                summary.errors += 1;
                summary.total += 1;
            }
        }
    }
    summary.duration = started.elapsed();
    summary
}

/// One warmup pass bucketed by outcome. `deleted` is the sum of the two
/// ignored buckets, reported separately so logs can tell the causes apart.
#[derive(Debug, Default)]
pub struct WarmupSummary {
    pub total: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub ignored_status: usize,
    pub ignored_cc: usize,
    pub errors: usize,
    pub duration: Duration,
    response_total: Duration,
    response_min: Option<Duration>,
    response_max: Duration,
}

impl WarmupSummary {
    /// `None` means the job never started because the global background cap
    /// was saturated.
    pub fn record(&mut self, outcome: Option<RevalidateOutcome>, elapsed: Duration) {
        self.total += 1;
        match outcome {
            Some(RevalidateOutcome::Unchanged) => self.unchanged += 1,
            Some(RevalidateOutcome::Updated) => self.updated += 1,
            Some(RevalidateOutcome::IgnoredStatus) => self.ignored_status += 1,
            Some(RevalidateOutcome::IgnoredCacheControl) => self.ignored_cc += 1,
            Some(RevalidateOutcome::Error) | None => {
                self.errors += 1;
                return;
            }
        }
        self.response_total += elapsed;
        self.response_min = Some(match self.response_min {
            Some(min) => min.min(elapsed),
            None => elapsed,
        });
        self.response_max = self.response_max.max(elapsed);
    }

    pub fn deleted(&self) -> usize {
        self.ignored_status + self.ignored_cc
    }

    pub fn rps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total as f64 / secs
    }

    fn response_avg(&self) -> Duration {
        let finished = self.total.saturating_sub(self.errors);
        if finished == 0 {
            return Duration::ZERO;
        }
        self.response_total / finished as u32
    }

    pub fn log(&self) {
        info!(
            urls = self.total,
            unchanged = self.unchanged,
            updated = self.updated,
            deleted = self.deleted(),
            ignored_status = self.ignored_status,
            ignored_cc = self.ignored_cc,
            errors = self.errors,
            duration_ms = self.duration.as_millis() as u64,
            rps = self.rps(),
            resp_min_ms = self.response_min.unwrap_or_default().as_millis() as u64,
            resp_avg_ms = self.response_avg().as_millis() as u64,
            resp_max_ms = self.response_max.as_millis() as u64,
            "warmup pass finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_outcomes() {
        let mut summary = WarmupSummary::default();
        summary.record(Some(RevalidateOutcome::Unchanged), Duration::from_millis(10));
        summary.record(Some(RevalidateOutcome::Updated), Duration::from_millis(30));
        summary.record(
            Some(RevalidateOutcome::IgnoredStatus),
            Duration::from_millis(20),
        );
        summary.record(
            Some(RevalidateOutcome::IgnoredCacheControl),
            Duration::from_millis(20),
        );
        summary.record(Some(RevalidateOutcome::Error), Duration::from_millis(5));
        summary.record(None, Duration::ZERO);

        assert_eq!(summary.total, 6);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.deleted(), 2);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.response_min, Some(Duration::from_millis(10)));
        assert_eq!(summary.response_max, Duration::from_millis(30));
        assert_eq!(summary.response_avg(), Duration::from_millis(20));
    }

    #[test]
    fn rps_guards_zero_duration() {
        let summary = WarmupSummary::default();
        assert_eq!(summary.rps(), 0.0);
    }
}
