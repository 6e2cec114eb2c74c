//! Rate-limit-aware fetch wrapper for callers of the repcache API surface.
//!
//! [`RetryClient::fetch_with_retry`] re-issues a request while the upstream
//! answers with a retryable status (only `429 Too Many Requests` by default)
//! or fails before producing a response, sleeping a fixed delay between
//! attempts. Any other response, successful or not, is handed back to the
//! caller untouched. Once the retry budget is spent a [`FetchError`] carrying
//! the last status, status text and body is returned.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Method, Response, StatusCode, Url, header::HeaderMap};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const BODY_CAPTURE_LIMIT: usize = 4096;

/// Retry budget for a single logical request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay_ms: u64,
    /// Statuses that trigger another attempt.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            retryable_status_codes: vec![StatusCode::TOO_MANY_REQUESTS.as_u16()],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Request shape replayed on every attempt.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FetchOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The upstream kept answering with a retryable status.
    Status,
    /// No response was received on the final attempt.
    Network,
    /// The request could not be built at all; never retried.
    InvalidRequest,
}

/// Raised once retries are exhausted.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub status: Option<StatusCode>,
    pub status_text: String,
    pub response_body: String,
    pub attempts: u32,
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(StatusCode::TOO_MANY_REQUESTS)
    }

    fn invalid_request(url: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            kind: FetchErrorKind::InvalidRequest,
            message: format!("invalid request to `{url}`: {reason}"),
            status: None,
            status_text: String::new(),
            response_body: String::new(),
            attempts: 0,
        }
    }

    fn exhausted(url: &Url, attempts: u32, failure: Failure) -> Self {
        match failure {
            Failure::Status { status, body } => {
                let status_text = status.canonical_reason().unwrap_or_default().to_string();
                Self {
                    kind: FetchErrorKind::Status,
                    message: format!(
                        "request to {url} failed after {attempts} attempts: {} {status_text}",
                        status.as_u16()
                    ),
                    status: Some(status),
                    status_text,
                    response_body: body,
                    attempts,
                }
            }
            Failure::Network(err) => Self {
                kind: FetchErrorKind::Network,
                message: format!("request to {url} failed after {attempts} attempts: {err}"),
                status: None,
                status_text: String::new(),
                response_body: err.to_string(),
                attempts,
            },
        }
    }
}

enum Failure {
    Status { status: StatusCode, body: String },
    Network(reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct RetryClient {
    client: Client,
}

impl RetryClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn user_agent() -> &'static str {
        concat!("repcache-client/", env!("CARGO_PKG_VERSION"))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Issue `options` against `url`, retrying per `policy`.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        options: &FetchOptions,
        policy: &RetryPolicy,
    ) -> Result<Response, FetchError> {
        let parsed = Url::parse(url).map_err(|err| FetchError::invalid_request(url, err))?;
        let mut attempt: u32 = 0;

        loop {
            let failure = match self.send_once(&parsed, options).await {
                Ok(response) if !policy.is_retryable(response.status()) => {
                    debug!(url = %parsed, status = response.status().as_u16(), attempt, "fetch completed");
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = capture_body(response).await;
                    Failure::Status { status, body }
                }
                Err(err) if err.is_builder() => {
                    return Err(FetchError::invalid_request(url, err));
                }
                Err(err) => Failure::Network(err),
            };

            if attempt >= policy.max_retries {
                return Err(FetchError::exhausted(&parsed, attempt + 1, failure));
            }

            match &failure {
                Failure::Status { status, body } => warn!(
                    url = %parsed,
                    status = status.as_u16(),
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = policy.retry_delay_ms,
                    body = %body,
                    "retryable status from upstream"
                ),
                Failure::Network(err) => warn!(
                    url = %parsed,
                    error = %err,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = policy.retry_delay_ms,
                    "network failure talking to upstream"
                ),
            }

            tokio::time::sleep(policy.retry_delay()).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, url: &Url, options: &FetchOptions) -> Result<Response, reqwest::Error> {
        let mut request = self
            .client
            .request(options.method.clone(), url.clone())
            .headers(options.headers.clone());
        if let Some(body) = options.body.as_ref() {
            request = request.body(body.clone());
        }
        request.send().await
    }
}

async fn capture_body(response: Response) -> String {
    let mut text = response.text().await.unwrap_or_default();
    if text.len() > BODY_CAPTURE_LIMIT {
        let mut cut = BODY_CAPTURE_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    async fn attempts(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .expect("request recording enabled")
            .len()
    }

    #[test]
    fn default_policy_only_retries_rate_limits() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay(), Duration::from_secs(1));
        assert!(policy.is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!policy.is_retryable(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scores"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scores"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .with_priority(2)
            .mount(&server)
            .await;

        let client = RetryClient::new().expect("client builds");
        let response = client
            .fetch_with_retry(
                &format!("{}/scores", server.uri()),
                &FetchOptions::get(),
                &fast_policy(3),
            )
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.expect("body"), "ok");
        assert_eq!(attempts(&server).await, 3);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_raises_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let client = RetryClient::new().expect("client builds");
        let err = client
            .fetch_with_retry(
                &format!("{}/scores", server.uri()),
                &FetchOptions::get(),
                &fast_policy(3),
            )
            .await
            .expect_err("all attempts rate limited");

        assert_eq!(attempts(&server).await, 4);
        assert_eq!(err.kind, FetchErrorKind::Status);
        assert_eq!(err.status, Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(err.status_text, "Too Many Requests");
        assert_eq!(err.response_body, "quota exceeded");
        assert_eq!(err.attempts, 4);
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn non_retryable_failure_is_returned_as_is() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = RetryClient::new().expect("client builds");
        let response = client
            .fetch_with_retry(&server.uri(), &FetchOptions::get(), &fast_policy(3))
            .await
            .expect("500 is the caller's problem");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(attempts(&server).await, 1);
    }

    #[tokio::test]
    async fn custom_retryable_statuses_are_honoured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            max_retries: 1,
            retry_delay_ms: 1,
            retryable_status_codes: vec![429, 503],
        };
        let client = RetryClient::new().expect("client builds");
        let err = client
            .fetch_with_retry(&server.uri(), &FetchOptions::get(), &policy)
            .await
            .expect_err("503 exhausts the budget");

        assert_eq!(attempts(&server).await, 2);
        assert_eq!(err.status, Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!err.is_rate_limited());
    }

    #[tokio::test]
    async fn body_is_replayed_on_every_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .with_priority(2)
            .mount(&server)
            .await;

        let options = FetchOptions::get()
            .with_method(Method::POST)
            .with_body(r#"{"handle":"alice"}"#);
        let client = RetryClient::new().expect("client builds");
        let response = client
            .fetch_with_retry(&server.uri(), &options, &fast_policy(2))
            .await
            .expect("second attempt accepted");

        assert_eq!(response.status(), StatusCode::CREATED);
        let requests = server.received_requests().await.expect("recorded");
        assert_eq!(requests.len(), 2);
        for request in requests {
            let body: serde_json::Value = serde_json::from_slice(&request.body).expect("json body");
            assert_eq!(body["handle"], "alice");
        }
    }

    #[tokio::test]
    async fn network_failures_exhaust_into_the_same_error_shape() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let client = RetryClient::new().expect("client builds");
        let err = client
            .fetch_with_retry(&format!("http://{addr}/"), &FetchOptions::get(), &fast_policy(2))
            .await
            .expect_err("nothing is listening");

        assert_eq!(err.kind, FetchErrorKind::Network);
        assert_eq!(err.status, None);
        assert_eq!(err.attempts, 3);
        assert!(!err.response_body.is_empty());
    }

    #[tokio::test]
    async fn malformed_url_is_not_retried() {
        let client = RetryClient::new().expect("client builds");
        let err = client
            .fetch_with_retry("not a url", &FetchOptions::get(), &fast_policy(5))
            .await
            .expect_err("url rejected");

        assert_eq!(err.kind, FetchErrorKind::InvalidRequest);
        assert_eq!(err.attempts, 0);
    }
}
