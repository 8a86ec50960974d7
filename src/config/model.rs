use std::time::Duration;

use serde::Deserialize;

/// Raw YAML shape of `wait0.yaml`, before validation and compilation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub storage: RawStorage,
    pub server: RawServer,
    #[serde(default, rename = "urlsDiscover")]
    pub urls_discover: Option<RawUrlsDiscover>,
    #[serde(default)]
    pub logging: RawLogging,
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStorage {
    pub ram: RawRamTier,
    pub disk: RawDiskTier,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRamTier {
    pub max: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDiskTier {
    pub max: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawServer {
    #[serde(default)]
    pub port: Option<u16>,
    pub origin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUrlsDiscover {
    /// `initalDelay` is a historical misspelling kept as an accepted alias.
    #[serde(
        default,
        rename = "initialDelay",
        alias = "initalDelay",
        with = "humantime_serde"
    )]
    pub initial_delay: Option<Duration>,
    #[serde(default, rename = "rediscoverEvery", with = "humantime_serde")]
    pub rediscover_every: Option<Duration>,
    #[serde(default)]
    pub sitemaps: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLogging {
    #[serde(default, with = "humantime_serde")]
    pub log_stats_every: Option<Duration>,
    #[serde(default)]
    pub log_warmup: bool,
    #[serde(default)]
    pub log_url_autodiscover: bool,
    /// Legacy switch; setting any duration here enables warmup logging.
    #[serde(default, with = "humantime_serde")]
    pub log_revalidation_every: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    #[serde(rename = "match")]
    pub match_expr: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub bypass: bool,
    #[serde(default, rename = "bypassWhenCookies")]
    pub bypass_when_cookies: Vec<String>,
    #[serde(default, with = "humantime_serde")]
    pub expiration: Option<Duration>,
    #[serde(default, rename = "warmUp")]
    pub warm_up: Option<RawWarmUp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawWarmUp {
    #[serde(rename = "runEvery", with = "humantime_serde")]
    pub run_every: Duration,
    #[serde(rename = "maxRequestsAtATime")]
    pub max_requests_at_a_time: usize,
}
