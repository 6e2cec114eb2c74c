use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url, header};
use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use super::envelope::{Envelope, Freshness, inspect};
use super::{CacheStore, StoreError, Ttl};
use crate::cache::clock::{SharedClock, system_clock};

const BACKEND: &str = "http_kv";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone)]
pub struct HttpKvConfig {
    pub base_url: Url,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

/// Fallback store speaking a plain HTTP key/value protocol.
///
/// The endpoint has no notion of expiry: every write embeds `createdAt` in
/// the envelope and every read computes the age and purges expired entries.
pub struct HttpKvStore {
    client: Client,
    config: HttpKvConfig,
    clock: SharedClock,
}

impl HttpKvStore {
    pub fn new(config: HttpKvConfig) -> Result<Self, StoreError> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: HttpKvConfig, clock: SharedClock) -> Result<Self, StoreError> {
        if config.base_url.cannot_be_a_base() {
            return Err(StoreError::protocol(
                BACKEND,
                format!("`{}` cannot be used as a base URL", config.base_url),
            ));
        }
        let client = Client::builder()
            .user_agent(concat!("repcache/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| StoreError::unavailable(BACKEND, err.to_string()))?;
        Ok(Self {
            client,
            config,
            clock,
        })
    }

    fn key_url(&self, key: &str) -> Url {
        let mut url = self.config.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(key);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let started = Instant::now();
        self.authorize(request).send().await.map_err(|err| {
            if err.is_timeout() {
                StoreError::Timeout {
                    backend: BACKEND,
                    elapsed_ms: elapsed_ms(started),
                }
            } else {
                StoreError::unavailable(BACKEND, err.to_string())
            }
        })
    }

    async fn purge(&self, key: &str) {
        if let Err(err) = self.delete(key).await {
            warn!(backend = BACKEND, key, error = %err, failure_class = err.failure_class(), "failed to purge entry");
        }
    }
}

#[async_trait]
impl CacheStore for HttpKvStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError> {
        let response = self.send(self.client.get(self.key_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        let raw = response
            .text()
            .await
            .map_err(|err| StoreError::unavailable(BACKEND, err.to_string()))?;

        match inspect(&raw, self.clock.now_millis(), ttl) {
            Freshness::Fresh(payload) => Ok(Some(payload)),
            Freshness::Expired { age_ms } => {
                debug!(backend = BACKEND, key, age_ms, "purging expired entry");
                self.purge(key).await;
                Ok(None)
            }
            Freshness::Corrupt(err) => {
                warn!(backend = BACKEND, key, error = %err, "purging corrupt envelope");
                self.purge(key).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, payload: &Value, _ttl: Ttl) -> Result<bool, StoreError> {
        let envelope = Envelope::new(self.clock.now_millis(), payload.clone());
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("key", key)
            .append_pair("value", &envelope.to_json(BACKEND)?)
            .finish();

        let request = self
            .client
            .post(self.config.base_url.clone())
            .header(header::CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body);
        ensure_success(self.send(request).await?).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let response = self.send(self.client.delete(self.key_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response).await?;
        Ok(true)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut url = self.config.base_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("prefix", pattern.trim_end_matches('*'));

        let response = ensure_success(self.send(self.client.get(url)).await?).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| StoreError::unavailable(BACKEND, err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::protocol(BACKEND, format!("invalid key listing: {err}")))
    }
}

async fn ensure_success(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(StoreError::unavailable(
        BACKEND,
        format!("status {status} body {text}"),
    ))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
