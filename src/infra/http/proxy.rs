//! Forwards cache misses to the origin through the retry client.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{
        HeaderMap, Request, StatusCode,
        header::{self, HeaderName},
    },
    response::{IntoResponse, Response},
};
use repcache_client::{FetchError, FetchErrorKind, FetchOptions, RetryClient, RetryPolicy};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::error::ErrorReport;

/// Headers that describe one hop and must not be relayed.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

pub struct Origin {
    client: RetryClient,
    base_url: Url,
    policy: RetryPolicy,
}

impl Origin {
    pub fn new(client: RetryClient, base_url: Url, policy: RetryPolicy) -> Self {
        Self {
            client,
            base_url,
            policy,
        }
    }

    /// Map a proxied path and query onto the origin base URL.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}{path}"));
        url.set_query(query);
        url
    }
}

pub async fn forward(State(origin): State<Arc<Origin>>, request: Request<Body>) -> Response {
    let (parts, _body) = request.into_parts();
    let url = origin.upstream_url(parts.uri.path(), parts.uri.query());
    let mut outbound = relayable(&parts.headers);
    // Bodies are buffered and parsed as JSON, so ask for them uncompressed.
    outbound.remove(header::ACCEPT_ENCODING);
    let options = FetchOptions::get().with_headers(outbound);

    let upstream = match origin
        .client
        .fetch_with_retry(url.as_str(), &options, &origin.policy)
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => return fetch_error_response(err),
    };

    let status = upstream.status();
    let headers = relayable(upstream.headers());
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(url = %url, error = %err, "origin body could not be read");
            let mut response = bad_gateway("Origin response could not be read");
            ErrorReport::from_error("infra::http::proxy", &err).attach(&mut response);
            return response;
        }
    };

    debug!(url = %url, status = status.as_u16(), bytes = bytes.len(), "origin answered");
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn relayable(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = headers.clone();
    for name in &HOP_BY_HOP {
        relayed.remove(name);
    }
    relayed
}

/// Exhausted retries surface as 503 with the error details; anything else
/// is a 502.
fn fetch_error_response(err: FetchError) -> Response {
    let status = match err.kind {
        FetchErrorKind::Status | FetchErrorKind::Network => StatusCode::SERVICE_UNAVAILABLE,
        FetchErrorKind::InvalidRequest => StatusCode::BAD_GATEWAY,
    };
    let report = ErrorReport::from_error("infra::http::proxy", &err);
    let body = json!({
        "error": err.message,
        "status": err.status.map(|status| status.as_u16()),
        "statusText": err.status_text,
        "responseBody": err.response_body,
        "attempts": err.attempts,
    });
    let mut response = (status, Json(body)).into_response();
    report.attach(&mut response);
    response
}

fn bad_gateway(message: &'static str) -> Response {
    (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(base: &str) -> Origin {
        Origin::new(
            RetryClient::new().expect("client builds"),
            Url::parse(base).expect("valid url"),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn upstream_url_keeps_the_base_path() {
        let origin = origin("https://api.example.com/v1/");
        assert_eq!(
            origin.upstream_url("/users/42", Some("page=2")).as_str(),
            "https://api.example.com/v1/users/42?page=2"
        );
        assert_eq!(
            origin.upstream_url("/", None).as_str(),
            "https://api.example.com/v1/"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.local".parse().expect("header"));
        headers.insert(header::CONNECTION, "keep-alive".parse().expect("header"));
        headers.insert(header::ACCEPT, "application/json".parse().expect("header"));

        let relayed = relayable(&headers);
        assert_eq!(relayed.len(), 1);
        assert!(relayed.contains_key(header::ACCEPT));
    }

    #[test]
    fn exhausted_rate_limit_maps_to_503() {
        let err = FetchError {
            kind: FetchErrorKind::Status,
            message: "gave up".to_string(),
            status: Some(StatusCode::TOO_MANY_REQUESTS),
            status_text: "Too Many Requests".to_string(),
            response_body: "slow down".to_string(),
            attempts: 4,
        };
        let response = fetch_error_response(err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.extensions().get::<ErrorReport>().is_some());
    }
}
