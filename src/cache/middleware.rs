//! Read-through response cache middleware.
//!
//! Serves GET requests from the cache when a fresh copy exists, otherwise
//! runs the inner service and writes its JSON body back on a detached task.
//! Cache trouble never reaches the client: every failure degrades to origin.

use std::sync::Arc;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;
use metrics::counter;
use serde_json::Value;
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::{debug, error, instrument};

use super::{
    CacheConfig, KeyBuilder,
    keys::CacheKey,
    service::{CacheStatus, Lookup, ReadThroughCache},
    store::Ttl,
};

pub const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");
pub const CDN_CACHE_CONTROL: HeaderName = HeaderName::from_static("cdn-cache-control");

const IMF_FIXDATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: Arc<CacheConfig>,
    pub cache: Arc<ReadThroughCache>,
    pub keys: Arc<KeyBuilder>,
}

impl CacheState {
    pub fn new(config: CacheConfig, cache: Arc<ReadThroughCache>) -> Self {
        let keys = Arc::new(config.key_builder());
        Self {
            config: Arc::new(config),
            cache,
            keys,
        }
    }
}

/// Middleware for read-through caching.
///
/// Only GET requests are considered. Only `200 OK` JSON bodies within
/// `max_body_bytes` are written back.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn read_through_layer(
    State(state): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    if state.config.dev_mode {
        return tagged(next.run(request).await, CacheStatus::DevMode);
    }

    let (parts, body) = request.into_parts();

    if bypass_requested(&parts.headers, &state.config.bypass_header)
        || state.cache.hooks().should_bypass(&parts)
    {
        counter!("repcache_cache_bypass_total").increment(1);
        debug!(outcome = "bypass", "skipping cache");
        let response = next.run(Request::from_parts(parts, body)).await;
        return tagged(response, CacheStatus::Bypass);
    }

    let key = state
        .keys
        .build_from_query(parts.uri.path(), parts.uri.query());

    match state.cache.resolve(&key).await {
        Lookup::Hit(value) => {
            debug!(key = %key, outcome = "hit", "serving cached response");
            return cached_response(&state, value, CacheStatus::Hit);
        }
        Lookup::Stale(value) => {
            debug!(key = %key, outcome = "stale", "serving stale response");
            return cached_response(&state, value, CacheStatus::Stale);
        }
        Lookup::Miss => {
            debug!(key = %key, outcome = "miss", "cache miss, executing handler");
        }
    }

    let response = next.run(Request::from_parts(parts, body)).await;
    tagged(write_back(&state, key, response).await, CacheStatus::Miss)
}

/// Buffer a cacheable origin response and schedule its write-back.
async fn write_back(state: &CacheState, key: CacheKey, response: Response) -> Response {
    if response.status() != StatusCode::OK || !is_json(response.headers()) {
        return response;
    }
    if declared_length(response.headers()).is_some_and(|len| len > state.config.max_body_bytes) {
        debug!(key = %key, "response exceeds cacheable size, passing through");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_within(body, state.config.max_body_bytes).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow(body)) => {
            debug!(key = %key, "streamed response exceeds cacheable size, passing through");
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            error!(key = %key, error = %err, "failed to buffer origin response");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) if state.cache.accepts(&value) => {
            state.cache.put_detached(key, value);
            if state.config.emit_cache_headers {
                apply_cache_headers(&mut parts.headers, state.cache.ttl(), OffsetDateTime::now_utc());
            }
        }
        Ok(_) => debug!(key = %key, "null response not cached"),
        Err(err) => debug!(key = %key, error = %err, "body is not valid JSON, not cached"),
    }

    Response::from_parts(parts, Body::from(bytes))
}

enum Buffered {
    Complete(Bytes),
    /// Limit crossed: what was read so far, then the untouched remainder.
    Overflow(Body),
}

/// Read `body` into memory until it ends or exceeds `limit` bytes.
async fn buffer_within(mut body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut buffered: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        if buffered.len() + data.len() > limit {
            let head = stream::iter([Ok::<_, axum::Error>(Bytes::from(buffered)), Ok(data)]);
            let relayed = head.chain(body.into_data_stream());
            return Ok(Buffered::Overflow(Body::from_stream(relayed)));
        }
        buffered.extend_from_slice(&data);
    }
    Ok(Buffered::Complete(Bytes::from(buffered)))
}

fn cached_response(state: &CacheState, value: Value, status: CacheStatus) -> Response {
    let mut response = (StatusCode::OK, Json(value)).into_response();
    if state.config.emit_cache_headers {
        let headers = response.headers_mut();
        if status == CacheStatus::Stale {
            apply_no_cache(headers);
        } else {
            apply_cache_headers(headers, state.cache.ttl(), OffsetDateTime::now_utc());
        }
    }
    tagged(response, status)
}

fn tagged(mut response: Response, status: CacheStatus) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE_STATUS, HeaderValue::from_static(status.as_str()));
    response
}

/// Present with any value other than `0` or `false`.
pub fn bypass_requested(headers: &HeaderMap, header: &str) -> bool {
    headers.get(header).is_some_and(|value| {
        let value = value.to_str().unwrap_or_default().trim();
        value != "0" && !value.eq_ignore_ascii_case("false")
    })
}

pub fn apply_cache_headers(headers: &mut HeaderMap, ttl: Ttl, now: OffsetDateTime) {
    let directive = format!("public, max-age={}", ttl.as_seconds());
    if let Ok(value) = HeaderValue::from_str(&directive) {
        headers.insert(CACHE_CONTROL, value.clone());
        headers.insert(CDN_CACHE_CONTROL, value);
    }
    if let Some(expires) = http_date(now + ttl.as_duration())
        .and_then(|date| HeaderValue::from_str(&date).ok())
    {
        headers.insert(EXPIRES, expires);
    }
}

fn apply_no_cache(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CDN_CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

pub fn http_date(at: OffsetDateTime) -> Option<String> {
    at.to_offset(time::UtcOffset::UTC).format(IMF_FIXDATE).ok()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
        .is_some_and(|mime| mime == "application/json" || mime.ends_with("+json"))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
