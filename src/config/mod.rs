pub mod loader;
pub mod model;

use std::path::PathBuf;
use std::time::Duration;

pub use loader::{from_yaml, load};

use crate::rules::RuleSet;

/// Validated runtime configuration, produced by the loader from the raw
/// YAML model. Sizes are parsed to bytes, durations to [`Duration`], and
/// rules are compiled and priority-sorted.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Origin URL prefix with any trailing slash trimmed.
    pub origin: String,
    pub ram_max: u64,
    pub disk_max: u64,
    pub disk_path: PathBuf,
    pub rules: RuleSet,
    pub discover: Option<DiscoverConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DiscoverConfig {
    pub initial_delay: Duration,
    /// Zero disables periodic rediscovery; the startup pass still runs.
    pub rediscover_every: Duration,
    pub sitemaps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub log_stats_every: Option<Duration>,
    pub log_warmup: bool,
    pub log_url_autodiscover: bool,
}
