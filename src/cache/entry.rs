use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

/// How a cache key entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveredBy {
    User,
    Sitemap,
}

/// What triggered the last successful refresh of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshCause {
    User,
    Warmup,
}

/// The cached unit: one origin response plus bookkeeping.
///
/// `inactive` entries are seeds planted by sitemap discovery. They are never
/// served to clients; they only exist so warmup has a key to fetch.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Unix seconds when the entry was admitted or last replaced; the basis
    /// for staleness checks.
    pub stored_at: u64,
    /// CRC32 (IEEE) of the body, compared during revalidation to skip
    /// rewrites of unchanged content.
    pub hash32: u32,
    pub inactive: bool,
    pub discovered_by: DiscoveredBy,
    /// Unix nanoseconds of the last successful refresh, zero if never.
    pub revalidated_at: u64,
    pub revalidated_by: Option<RefreshCause>,
}

impl CacheEntry {
    /// Builds an entry from an origin response. `Content-Length` is stripped
    /// here; the HTTP writer recomputes it from the body on the way out.
    pub fn from_origin(
        status: StatusCode,
        mut headers: HeaderMap,
        body: Bytes,
        discovered_by: DiscoveredBy,
    ) -> Self {
        headers.remove(http::header::CONTENT_LENGTH);
        let hash32 = crc32fast::hash(&body);
        Self {
            status,
            headers,
            body,
            stored_at: now_unix(),
            hash32,
            inactive: false,
            discovered_by,
            revalidated_at: 0,
            revalidated_by: None,
        }
    }

    /// An inactive placeholder for a sitemap-discovered path. Warmup turns
    /// seeds into real entries; lookups treat them as misses.
    pub fn seed() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            stored_at: now_unix(),
            hash32: 0,
            inactive: true,
            discovered_by: DiscoveredBy::Sitemap,
            revalidated_at: 0,
            revalidated_by: None,
        }
    }

    pub fn mark_revalidated(&mut self, cause: RefreshCause) {
        self.revalidated_at = now_unix_nanos();
        self.revalidated_by = Some(cause);
    }

    /// Serializes to the on-disk representation; the encoded length is also
    /// what both tiers use for size accounting.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let persisted = PersistedEntry {
            status: self.status.as_u16(),
            headers: headers_to_pairs(&self.headers),
            body: self.body.to_vec(),
            stored_at: self.stored_at,
            hash32: self.hash32,
            inactive: self.inactive,
            discovered_by: self.discovered_by,
            revalidated_at: self.revalidated_at,
            revalidated_by: self.revalidated_by,
        };
        Ok(bincode::serialize(&persisted)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let persisted: PersistedEntry = bincode::deserialize(data)?;
        Ok(Self {
            status: StatusCode::from_u16(persisted.status).unwrap_or(StatusCode::OK),
            headers: pairs_to_headers(&persisted.headers),
            body: Bytes::from(persisted.body),
            stored_at: persisted.stored_at,
            hash32: persisted.hash32,
            inactive: persisted.inactive,
            discovered_by: persisted.discovered_by,
            revalidated_at: persisted.revalidated_at,
            revalidated_by: persisted.revalidated_by,
        })
    }
}

/// Stable serialized mirror of [`CacheEntry`]; keep field order fixed so the
/// on-disk format survives refactors of the in-memory type.
#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    status: u16,
    headers: Vec<(String, Vec<String>)>,
    body: Vec<u8>,
    stored_at: u64,
    hash32: u32,
    inactive: bool,
    discovered_by: DiscoveredBy,
    revalidated_at: u64,
    revalidated_by: Option<RefreshCause>,
}

fn headers_to_pairs(map: &HeaderMap) -> Vec<(String, Vec<String>)> {
    let mut pairs = Vec::new();
    for name in map.keys() {
        let values: Vec<String> = map
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect();
        pairs.push((name.as_str().to_string(), values));
    }
    pairs
}

fn pairs_to_headers(pairs: &[(String, Vec<String>)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in pairs {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
