use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use http::{HeaderMap, Method, StatusCode};
use tracing::warn;

use super::AppContext;
use super::headers::{WAIT0_HEADER, Wait0, has_any_cookie, set_wait0_headers};
use super::origin::StatusKind;
use crate::cache::entry::{CacheEntry, RefreshCause};
use crate::rules::{Rule, is_stale};

/// Serves one request with the stale-while-revalidate protocol:
/// bypass gates first, then RAM, then disk (with promotion), then the miss
/// path against the origin. A stale hit answers immediately and schedules a
/// background refresh.
pub async fn handle(State(app): State<Arc<AppContext>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let rule = app.config.rules.pick(&path);

    if let Some(rule) = rule {
        if rule.bypass {
            return proxy_pass(&app, request_uri(&req), req.headers(), Wait0::Bypass).await;
        }
        if has_any_cookie(req.headers(), &rule.bypass_when_cookies) {
            return proxy_pass(&app, request_uri(&req), req.headers(), Wait0::IgnoreByCookie).await;
        }
    }

    if req.method() != Method::GET {
        return proxy_pass(&app, request_uri(&req), req.headers(), Wait0::Bypass).await;
    }

    // The cache key is the path alone; query variance must not thrash it.
    let key = path;

    if let Some(entry) = app.ram.get(&key) {
        maybe_revalidate(&app, rule, &entry, &key, query.as_deref());
        return entry_response(&app, entry, Wait0::Hit);
    }

    if let Some(entry) = app.disk.get(&key) {
        app.ram
            .put(&key, entry.clone(), app.disk.as_ref(), &app.overflow_log);
        maybe_revalidate(&app, rule, &entry, &key, query.as_deref());
        return entry_response(&app, entry, Wait0::Hit);
    }

    // Miss: fetch, classify, and decide whether the response may be stored.
    let fetched = match app.origin.fetch(request_uri(&req), Some(req.headers())).await {
        Ok(fetched) => fetched,
        Err(err) => {
            warn!(error = %err, key, "origin fetch failed");
            return bad_gateway_response();
        }
    };

    if fetched.status_kind == StatusKind::IgnoreByStatus {
        app.ram.delete(&key);
        app.disk.delete(&key).await;
        return entry_response(&app, fetched.entry, Wait0::IgnoreByStatus);
    }

    if !fetched.cacheable {
        return entry_response(&app, fetched.entry, Wait0::Bypass);
    }

    store(&app, &key, fetched.entry.clone());
    entry_response(&app, fetched.entry, Wait0::Miss)
}

fn request_uri(req: &Request) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path())
}

/// RAM first (which may cascade into disk through eviction), then disk for
/// durability.
fn store(app: &AppContext, key: &str, entry: CacheEntry) {
    app.ram
        .put(key, entry.clone(), app.disk.as_ref(), &app.overflow_log);
    app.disk.put_async(key, entry);
}

fn maybe_revalidate(
    app: &AppContext,
    rule: Option<&Rule>,
    entry: &CacheEntry,
    key: &str,
    query: Option<&str>,
) {
    let Some(rule) = rule else {
        return;
    };
    if rule.expiration.is_zero() || !is_stale(entry.stored_at, rule.expiration) {
        return;
    }
    app.revalidator.kick(key, query, RefreshCause::User);
}

async fn proxy_pass(app: &AppContext, uri: &str, headers: &HeaderMap, tag: Wait0) -> Response {
    match app.origin.fetch(uri, Some(headers)).await {
        Ok(fetched) => entry_response(app, fetched.entry, tag),
        Err(err) => {
            warn!(error = %err, path = uri, "origin fetch failed");
            bad_gateway_response()
        }
    }
}

fn entry_response(app: &AppContext, entry: CacheEntry, tag: Wait0) -> Response {
    if tag.counts_for_stats()
        && let Some(stats) = &app.stats
    {
        stats.observe(entry.body.len());
    }

    let mut headers = HeaderMap::with_capacity(entry.headers.len() + 2);
    for (name, value) in entry.headers.iter() {
        if *name == WAIT0_HEADER {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    set_wait0_headers(&mut headers, tag);

    let mut response = Response::new(Body::from(entry.body));
    *response.status_mut() = entry.status;
    *response.headers_mut() = headers;
    response
}

fn bad_gateway_response() -> Response {
    let mut headers = HeaderMap::new();
    set_wait0_headers(&mut headers, Wait0::BadGateway);
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    let mut response = Response::new(Body::from("bad gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    *response.headers_mut() = headers;
    response
}
