use http::header::{ACCEPT_ENCODING, ACCESS_CONTROL_EXPOSE_HEADERS, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};

pub const WAIT0_HEADER: HeaderName = HeaderName::from_static("x-wait0");

/// Cache disposition stamped on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait0 {
    Hit,
    Miss,
    Bypass,
    IgnoreByCookie,
    IgnoreByStatus,
    BadGateway,
}

impl Wait0 {
    pub fn as_str(self) -> &'static str {
        match self {
            Wait0::Hit => "hit",
            Wait0::Miss => "miss",
            Wait0::Bypass => "bypass",
            Wait0::IgnoreByCookie => "ignore-by-cookie",
            Wait0::IgnoreByStatus => "ignore-by-status",
            Wait0::BadGateway => "bad-gateway",
        }
    }

    pub fn counts_for_stats(self) -> bool {
        matches!(self, Wait0::Hit | Wait0::Miss)
    }
}

pub fn set_wait0_headers(headers: &mut HeaderMap, tag: Wait0) {
    headers.insert(WAIT0_HEADER, HeaderValue::from_static(tag.as_str()));
    // Browsers can only read custom headers cross-origin when they are
    // explicitly exposed.
    ensure_exposed_header(headers, "X-Wait0");
}

/// Adds `name` to `Access-Control-Expose-Headers`, merging any existing
/// values into one comma-separated header without duplicating the name.
fn ensure_exposed_header(headers: &mut HeaderMap, name: &str) {
    let current: Vec<String> = headers
        .get_all(ACCESS_CONTROL_EXPOSE_HEADERS)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();

    if current.is_empty() {
        if let Ok(value) = HeaderValue::from_str(name) {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
        return;
    }

    let merged = current.join(",");
    if merged
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(name))
    {
        if current.len() > 1
            && let Ok(value) = HeaderValue::from_str(&merged)
        {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
        return;
    }

    if let Ok(value) = HeaderValue::from_str(&format!("{}, {name}", merged.trim())) {
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
    }
}

/// Copy of the client's request headers for the upstream request, minus
/// `Host` (the client targets the proxy, not the origin) and
/// `Accept-Encoding` (the fetcher sets its own identity value; a client's
/// `gzip, deflate, br` must never reach the origin).
pub fn copy_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        if *name == HOST || *name == ACCEPT_ENCODING {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// True iff any cookie on the request has one of the given names.
pub fn has_any_cookie(headers: &HeaderMap, names: &[String]) -> bool {
    if names.is_empty() {
        return false;
    }
    let wanted: Vec<&str> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    if wanted.is_empty() {
        return false;
    }

    for value in headers.get_all(http::header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let name = pair.split('=').next().unwrap_or("").trim();
            if wanted.iter().any(|w| *w == name) {
                return true;
            }
        }
    }
    false
}
