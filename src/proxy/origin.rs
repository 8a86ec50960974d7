use std::time::Duration;

use bytes::Bytes;
use http::header::ACCEPT_ENCODING;
use http::{HeaderMap, HeaderValue, StatusCode};

use super::headers::copy_request_headers;
use crate::cache::entry::{CacheEntry, DiscoveredBy};

const ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Network or read failure while talking to the origin. Surfaces as a 502
/// on the serving path; background refreshes swallow it.
#[derive(Debug, thiserror::Error)]
#[error("origin request failed: {0}")]
pub struct FetchError(#[from] reqwest::Error);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    IgnoreByStatus,
}

pub struct FetchedResponse {
    pub entry: CacheEntry,
    pub status_kind: StatusKind,
    pub cacheable: bool,
}

/// Upstream GET client. Every fetch asks for identity encoding so bodies
/// are stored raw, and reads the whole body into memory.
#[derive(Clone)]
pub struct OriginClient {
    origin: String,
    client: reqwest::Client,
}

impl OriginClient {
    pub fn new(origin: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ORIGIN_TIMEOUT)
            .build()?;
        Ok(Self { origin, client })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// GETs `origin + path_and_query` and classifies the response.
    ///
    /// `request_headers`, when given, are forwarded minus `Host` and minus
    /// the client's `Accept-Encoding`. The request is always a GET
    /// regardless of the client's method.
    pub async fn fetch(
        &self,
        path_and_query: &str,
        request_headers: Option<&HeaderMap>,
    ) -> Result<FetchedResponse, FetchError> {
        let url = format!("{}{}", self.origin, path_and_query);
        let mut headers = match request_headers {
            Some(headers) => copy_request_headers(headers),
            None => HeaderMap::new(),
        };
        // Replace, never append: the origin must see exactly one identity
        // value so bodies arrive uncompressed.
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let response = self.client.get(&url).headers(headers).send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        let entry = CacheEntry::from_origin(status, headers, body, DiscoveredBy::User);
        let status_kind = if status.is_success() {
            StatusKind::Ok
        } else {
            StatusKind::IgnoreByStatus
        };
        let cacheable = status_kind == StatusKind::Ok && is_dynamic_response(&entry.headers);

        Ok(FetchedResponse {
            entry,
            status_kind,
            cacheable,
        })
    }

    /// Plain GET of an absolute URL (sitemap fetches). No header forwarding,
    /// no classification.
    pub async fn fetch_absolute(&self, url: &str) -> Result<(StatusCode, Bytes), FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body))
    }
}

/// Whether the origin marked this response as dynamic.
///
/// Deliberately inverted from standard HTTP caching: `no-store`, `no-cache`,
/// or `max-age=0` is how the origin flags server-rendered pages, and those
/// are exactly the responses this proxy caches. Responses without any of the
/// three markers are passed through uncached. Do not "fix" this.
pub fn is_dynamic_response(headers: &HeaderMap) -> bool {
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let value = value.to_ascii_lowercase();
        if value.contains("no-store") || value.contains("no-cache") || value.contains("max-age=0")
        {
            return true;
        }
    }
    false
}
