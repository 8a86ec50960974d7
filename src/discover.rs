use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::entry::CacheEntry;
use crate::cache::{DiskCache, RamCache};
use crate::config::{Config, DiscoverConfig};
use crate::proxy::origin::OriginClient;

const PASS_DEADLINE: Duration = Duration::from_secs(120);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Spawns sitemap discovery: one pass after the initial delay, then a
/// periodic re-run when configured. Discovered paths become inactive seeds
/// on disk so warmup can fill them before any user visit.
pub fn spawn(
    discover: DiscoverConfig,
    origin: OriginClient,
    config: Arc<Config>,
    ram: Arc<RamCache>,
    disk: Arc<DiskCache>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !discover.initial_delay.is_zero() {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(discover.initial_delay) => {}
            }
        }

        run_pass(&discover, &origin, &config, &ram, &disk, &stop).await;

        if discover.rediscover_every.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(discover.rediscover_every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = ticker.tick() => {}
            }
            run_pass(&discover, &origin, &config, &ram, &disk, &stop).await;
        }
    })
}

async fn run_pass(
    discover: &DiscoverConfig,
    origin: &OriginClient,
    config: &Config,
    ram: &RamCache,
    disk: &DiskCache,
    stop: &watch::Receiver<bool>,
) {
    match tokio::time::timeout(
        PASS_DEADLINE,
        discover_once(discover, origin, config, ram, disk, stop),
    )
    .await
    {
        Ok((stored, ignored)) => info!(stored, ignored, "urls discover pass finished"),
        Err(_) => warn!("urls discover pass hit its deadline"),
    }
}

/// Walks the sitemap queue breadth-first, enqueuing nested sitemap indexes
/// and seeding every fitting URL that has no active cache entry yet.
async fn discover_once(
    discover: &DiscoverConfig,
    origin: &OriginClient,
    config: &Config,
    ram: &RamCache,
    disk: &DiskCache,
    stop: &watch::Receiver<bool>,
) -> (usize, usize) {
    let mut stored = 0usize;
    let mut ignored = 0usize;

    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = discover
        .sitemaps
        .iter()
        .map(|url| normalize_sitemap_url(origin.origin(), url))
        .collect();

    while let Some(sitemap_url) = queue.pop_front() {
        if *stop.borrow() {
            return (stored, ignored);
        }
        if !seen.insert(sitemap_url.clone()) {
            continue;
        }

        let doc = match fetch_and_parse(origin, &sitemap_url).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, sitemap = %sitemap_url, "failed to read sitemap");
                continue;
            }
        };

        for nested in &doc.sitemaps {
            queue.push_back(normalize_sitemap_url(origin.origin(), nested));
        }

        let mut fit = 0usize;
        let mut ignored_here = 0usize;
        for loc in &doc.urls {
            let Some(path) = path_from_loc(loc) else {
                ignored_here += 1;
                continue;
            };

            let rule = config.rules.pick(&path);
            if rule.is_none_or(|rule| rule.bypass) {
                ignored_here += 1;
                ignored += 1;
                continue;
            }
            fit += 1;

            // Never clobber active content; only missing or inactive keys
            // are seeded.
            if ram.peek(&path).is_some_and(|entry| !entry.inactive) {
                continue;
            }
            if disk.peek(&path).is_some_and(|entry| !entry.inactive) {
                continue;
            }

            disk.put_async(&path, CacheEntry::seed());
            stored += 1;
        }

        if config.logging.log_url_autodiscover {
            info!(
                sitemap = %sitemap_url,
                urls = doc.urls.len(),
                fit,
                ignored = ignored_here,
                "sitemap scanned"
            );
        }
    }

    (stored, ignored)
}

#[derive(Debug, Default, PartialEq)]
struct SitemapDoc {
    urls: Vec<String>,
    sitemaps: Vec<String>,
}

async fn fetch_and_parse(origin: &OriginClient, url: &str) -> Result<SitemapDoc> {
    let (status, body) = origin
        .fetch_absolute(url)
        .await
        .context("sitemap fetch failed")?;
    if !status.is_success() {
        bail!("unexpected sitemap status {status}");
    }
    let body = maybe_gunzip(url, body.to_vec());
    parse_sitemap(&body)
}

/// Decompresses when the URL ends in `.gz` or the body starts with the gzip
/// magic. Tolerant of servers that already decompressed a `.gz` URL via
/// Content-Encoding: a failed decode falls back to the raw bytes.
fn maybe_gunzip(url: &str, body: Vec<u8>) -> Vec<u8> {
    let looks_gzipped = url.to_ascii_lowercase().ends_with(".gz")
        || body.len() >= 2 && body[..2] == GZIP_MAGIC;
    if !looks_gzipped {
        return body;
    }
    let mut decoder = GzDecoder::new(body.as_slice());
    let mut unzipped = Vec::new();
    match decoder.read_to_end(&mut unzipped) {
        Ok(_) => unzipped,
        Err(_) => body,
    }
}

/// Pulls `loc` values out of `urlset/url` and `sitemapindex/sitemap`
/// documents. Whitespace inside `loc` elements is trimmed.
fn parse_sitemap(body: &[u8]) -> Result<SitemapDoc> {
    let text = std::str::from_utf8(body).context("sitemap is not valid UTF-8")?;
    let document = roxmltree::Document::parse(text).context("sitemap XML parse failed")?;

    let mut doc = SitemapDoc::default();
    for node in document.root_element().children() {
        if !node.is_element() {
            continue;
        }
        let bucket = match node.tag_name().name() {
            "url" => &mut doc.urls,
            "sitemap" => &mut doc.sitemaps,
            _ => continue,
        };
        let loc = node
            .children()
            .find(|child| child.is_element() && child.tag_name().name() == "loc")
            .and_then(|child| child.text())
            .map(str::trim)
            .unwrap_or_default();
        if !loc.is_empty() {
            bucket.push(loc.to_string());
        }
    }
    Ok(doc)
}

/// Relative sitemap references are resolved against the origin.
fn normalize_sitemap_url(origin: &str, url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    if url.starts_with('/') {
        format!("{origin}{url}")
    } else {
        format!("{origin}/{url}")
    }
}

/// Extracts the cache key from a sitemap `loc`: the path alone, host and
/// query ignored.
fn path_from_loc(loc: &str) -> Option<String> {
    let loc = loc.trim();
    if loc.is_empty() {
        return None;
    }

    let path = if let Some(rest) = loc
        .strip_prefix("http://")
        .or_else(|| loc.strip_prefix("https://"))
    {
        match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "/",
        }
    } else {
        loc
    };

    let path = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Some("/".to_string());
    }
    if path.starts_with('/') {
        Some(path.to_string())
    } else {
        Some(format!("/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/a</loc><lastmod>2024-01-01</lastmod></url>
  <url><loc>
    https://example.com/b
  </loc></url>
</urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://example.com/sitemap-1.xml</loc></sitemap>
  <sitemap><loc>/sitemap-2.xml.gz</loc></sitemap>
</sitemapindex>"#;

    #[test]
    fn parses_urlset_and_trims_locs() {
        let doc = parse_sitemap(URLSET.as_bytes()).unwrap();
        assert_eq!(
            doc.urls,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string()
            ]
        );
        assert!(doc.sitemaps.is_empty());
    }

    #[test]
    fn parses_sitemap_index() {
        let doc = parse_sitemap(INDEX.as_bytes()).unwrap();
        assert!(doc.urls.is_empty());
        assert_eq!(doc.sitemaps.len(), 2);
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(parse_sitemap(b"<urlset><url>").is_err());
        assert!(parse_sitemap(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn gunzips_by_magic_and_suffix() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(URLSET.as_bytes()).unwrap();
        let gzipped = encoder.finish().unwrap();

        // magic-based detection, plain url
        let doc = parse_sitemap(&maybe_gunzip("https://e/sitemap.xml", gzipped.clone())).unwrap();
        assert_eq!(doc.urls.len(), 2);

        // suffix-based detection on already-decompressed body falls back
        let raw = maybe_gunzip("https://e/sitemap.xml.gz", URLSET.as_bytes().to_vec());
        assert_eq!(raw, URLSET.as_bytes());
    }

    #[test]
    fn normalizes_relative_sitemap_urls() {
        assert_eq!(
            normalize_sitemap_url("http://o", "/sitemap.xml"),
            "http://o/sitemap.xml"
        );
        assert_eq!(
            normalize_sitemap_url("http://o", "sitemap.xml"),
            "http://o/sitemap.xml"
        );
        assert_eq!(
            normalize_sitemap_url("http://o", "https://cdn/sitemap.xml"),
            "https://cdn/sitemap.xml"
        );
    }

    #[test]
    fn extracts_paths_from_locs() {
        assert_eq!(
            path_from_loc("https://example.com/x/y?q=1#frag").unwrap(),
            "/x/y"
        );
        assert_eq!(path_from_loc("http://example.com").unwrap(), "/");
        assert_eq!(path_from_loc("relative/page").unwrap(), "/relative/page");
        assert_eq!(path_from_loc("/already/rooted").unwrap(), "/already/rooted");
        assert!(path_from_loc("   ").is_none());
    }
}
