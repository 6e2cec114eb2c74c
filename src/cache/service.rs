//! Read-through cache service.
//!
//! Owns the policy half of caching: bounded lookups, stale fallback, payload
//! encoding and detached write-back. The HTTP middleware and programmatic
//! callers share it through [`ReadThroughCache::resolve`] and
//! [`ReadThroughCache::get_or_compute`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::Codec;
use super::config::{CacheConfig, CacheHooks};
use super::error::CacheError;
use super::keys::CacheKey;
use super::store::{CacheStore, Ttl};

/// Outcome reported in `X-Cache-Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
    Bypass,
    DevMode,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
            Self::Bypass => "BYPASS",
            Self::DevMode => "DEV-MODE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(Value),
    Stale(Value),
    Miss,
}

pub struct ReadThroughCache {
    store: Arc<dyn CacheStore>,
    codec: Codec,
    hooks: CacheHooks,
    ttl: Ttl,
    stale_ttl: Option<Ttl>,
    retention: Ttl,
    lookup_timeout: Duration,
    write_timeout: Duration,
    cache_null_values: bool,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn CacheStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            codec: Codec::new(config.compression),
            hooks: CacheHooks::default(),
            ttl: config.ttl(),
            stale_ttl: config.stale_ttl(),
            retention: config.retention(),
            lookup_timeout: config.lookup_timeout(),
            write_timeout: config.write_timeout(),
            cache_null_values: config.cache_null_values,
        }
    }

    pub fn with_hooks(mut self, hooks: CacheHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks(&self) -> &CacheHooks {
        &self.hooks
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Whether `value` qualifies for write-back.
    pub fn accepts(&self, value: &Value) -> bool {
        self.cache_null_values || !value.is_null()
    }

    /// Fresh lookup, falling back to a stale read when the backend fails.
    ///
    /// Never returns an error: every failure is logged, reported to the error
    /// callback and downgraded to [`Lookup::Miss`].
    pub async fn resolve(&self, key: &CacheKey) -> Lookup {
        let err = match self.lookup(key, self.ttl, "lookup").await {
            Ok(Some(value)) => {
                counter!("repcache_cache_hit_total").increment(1);
                return Lookup::Hit(value);
            }
            Ok(None) => {
                counter!("repcache_cache_miss_total").increment(1);
                return Lookup::Miss;
            }
            Err(err) => err,
        };

        warn!(
            key = %key,
            failure_class = err.failure_class(),
            error = %err,
            "cache lookup failed, degrading"
        );
        self.hooks.report(key, &err);

        if let Some(stale_ttl) = self.stale_ttl {
            match self.lookup(key, stale_ttl, "stale_lookup").await {
                Ok(Some(value)) => {
                    counter!("repcache_cache_stale_total").increment(1);
                    debug!(key = %key, stale_ttl_minutes = stale_ttl.as_minutes(), "serving stale copy");
                    return Lookup::Stale(value);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(key = %key, failure_class = err.failure_class(), error = %err, "stale lookup failed");
                }
            }
        }

        counter!("repcache_cache_miss_total").increment(1);
        Lookup::Miss
    }

    async fn lookup(
        &self,
        key: &CacheKey,
        ttl: Ttl,
        op: &'static str,
    ) -> Result<Option<Value>, CacheError> {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.lookup_timeout, self.store.get(key.as_str(), ttl)).await;
        let elapsed = started.elapsed();
        histogram!("repcache_lookup_ms").record(elapsed.as_secs_f64() * 1_000.0);

        let payload = match outcome {
            Ok(result) => result?,
            Err(_) => return Err(CacheError::timeout(op, elapsed_ms(elapsed))),
        };
        Ok(payload.and_then(|payload| self.codec.decode(payload)))
    }

    /// Encode and write `value`, keeping it for the retention window.
    pub async fn put(&self, key: &CacheKey, value: &Value) -> Result<bool, CacheError> {
        let payload = self.codec.encode(value)?;
        Ok(self.store.set(key.as_str(), &payload, self.retention).await?)
    }

    /// Write-back on a detached task, bounded by the write timeout. Callers
    /// must not await the handle on the response path.
    pub fn put_detached(self: &Arc<Self>, key: CacheKey, value: Value) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(cache.write_timeout, cache.put(&key, &value))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(CacheError::timeout(
                    "write_back",
                    elapsed_ms(started.elapsed()),
                )),
            };
            match outcome {
                Ok(_) => {
                    counter!("repcache_cache_write_total", "outcome" => "ok").increment(1);
                    debug!(key = %key, elapsed_ms = elapsed_ms(started.elapsed()), "write-back stored");
                }
                Err(err) => {
                    counter!("repcache_cache_write_total", "outcome" => "error").increment(1);
                    warn!(
                        key = %key,
                        elapsed_ms = elapsed_ms(started.elapsed()),
                        failure_class = err.failure_class(),
                        error = %err,
                        "write-back failed"
                    );
                    cache.hooks.report(&key, &err);
                }
            }
        })
    }

    /// Read-through for non-HTTP callers.
    ///
    /// On a miss `compute` runs and its result is written back in the
    /// background; its error is returned untouched.
    pub async fn get_or_compute<F, Fut, E>(
        self: &Arc<Self>,
        key: &CacheKey,
        compute: F,
    ) -> Result<(Value, CacheStatus), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        match self.resolve(key).await {
            Lookup::Hit(value) => return Ok((value, CacheStatus::Hit)),
            Lookup::Stale(value) => return Ok((value, CacheStatus::Stale)),
            Lookup::Miss => {}
        }

        let value = compute().await?;
        if self.accepts(&value) {
            self.put_detached(key.clone(), value.clone());
        }
        Ok((value, CacheStatus::Miss))
    }

    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store.delete(key).await?)
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self.store.list_keys(prefix).await?)
    }

    /// Delete every key starting with `prefix`. Returns how many were removed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut removed = 0;
        for key in self.keys(prefix).await? {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn release(&self) {
        self.store.release().await;
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
