use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use super::model::{RawConfig, RawRule};
use super::{Config, DiscoverConfig, LoggingConfig};
use crate::rules::{Rule, RuleSet, WarmupRule, parse_match};
use crate::util::parse_bytes;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DISK_PATH: &str = "./data/cache";

pub fn load(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    from_yaml(&data).with_context(|| format!("failed to load config at {}", path.display()))
}

pub fn from_yaml(data: &str) -> Result<Config> {
    let raw: RawConfig = serde_yaml::from_str(data).context("failed to parse config")?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<Config> {
    let ram_max = parse_bytes(&raw.storage.ram.max).context("storage.ram.max")?;
    let disk_max = parse_bytes(&raw.storage.disk.max).context("storage.disk.max")?;
    let disk_path = PathBuf::from(
        raw.storage
            .disk
            .path
            .unwrap_or_else(|| DEFAULT_DISK_PATH.to_string()),
    );

    let origin = raw.server.origin.trim().trim_end_matches('/').to_string();
    if origin.is_empty() {
        bail!("server.origin is required");
    }
    let port = raw.server.port.unwrap_or(DEFAULT_PORT);

    let mut rules = Vec::with_capacity(raw.rules.len());
    for (idx, rule) in raw.rules.into_iter().enumerate() {
        rules.push(compile_rule(rule).with_context(|| format!("rules[{idx}]"))?);
    }

    let discover = raw.urls_discover.and_then(|d| {
        let sitemaps: Vec<String> = d
            .sitemaps
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if sitemaps.is_empty() {
            return None;
        }
        Some(DiscoverConfig {
            initial_delay: d.initial_delay.unwrap_or(Duration::ZERO),
            rediscover_every: d.rediscover_every.unwrap_or(Duration::ZERO),
            sitemaps,
        })
    });

    let logging = LoggingConfig {
        log_stats_every: raw.logging.log_stats_every,
        log_warmup: raw.logging.log_warmup || raw.logging.log_revalidation_every.is_some(),
        log_url_autodiscover: raw.logging.log_url_autodiscover,
    };
    if let Some(every) = logging.log_stats_every
        && every.is_zero()
    {
        bail!("logging.log_stats_every: must be > 0");
    }

    Ok(Config {
        port,
        origin,
        ram_max,
        disk_max,
        disk_path,
        rules: RuleSet::new(rules),
        discover,
        logging,
    })
}

fn compile_rule(raw: RawRule) -> Result<Rule> {
    let matchers = parse_match(&raw.match_expr).context("match")?;
    let warmup = match raw.warm_up {
        Some(w) => {
            if w.run_every.is_zero() {
                bail!("warmUp.runEvery: must be > 0");
            }
            if w.max_requests_at_a_time == 0 {
                bail!("warmUp.maxRequestsAtATime: must be > 0");
            }
            Some(WarmupRule {
                run_every: w.run_every,
                max_in_flight: w.max_requests_at_a_time,
            })
        }
        None => None,
    };
    Ok(Rule {
        matchers,
        priority: raw.priority,
        bypass: raw.bypass,
        bypass_when_cookies: raw.bypass_when_cookies,
        expiration: raw.expiration.unwrap_or(Duration::ZERO),
        warmup,
    })
}
