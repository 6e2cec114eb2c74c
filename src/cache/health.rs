//! Backend health tracking.
//!
//! [`BackendHealth`] is a two-state breaker: `Closed` while the primary keeps
//! answering, `Open` once consecutive failures reach the threshold or a fatal
//! failure is seen. There is no way back to `Closed` within a process; a
//! restart is the reset.
//!
//! [`GuardedStore`] bounds every call with its own timeout. A call that runs
//! out of time is a [`StoreError::Timeout`] and counts like any other
//! failure, so a hanging primary trips the breaker and the tiered store
//! moves on to the fallback within one lookup.

use std::future::Future;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use super::store::{CacheStore, StoreError, Ttl};

pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub backend: &'static str,
    pub state: BreakerState,
    pub consecutive_errors: u32,
    pub error_threshold: u32,
}

/// Per-process breaker state for one backend.
#[derive(Debug)]
pub struct BackendHealth {
    backend: &'static str,
    threshold: u32,
    consecutive_errors: AtomicU32,
    disabled: AtomicBool,
}

impl BackendHealth {
    pub fn new(backend: &'static str, threshold: u32) -> Self {
        Self {
            backend,
            threshold: threshold.max(1),
            consecutive_errors: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BreakerState {
        if self.is_disabled() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Count a failure. Returns `true` when this call opened the breaker.
    pub fn record_failure(&self, err: &StoreError) -> bool {
        let count = self
            .consecutive_errors
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        counter!("repcache_cache_backend_error_total", "backend" => self.backend).increment(1);

        if err.is_fatal() || count >= self.threshold {
            return self.trip(count, err);
        }

        warn!(
            backend = self.backend,
            consecutive_errors = count,
            error_threshold = self.threshold,
            failure_class = err.failure_class(),
            error = %err,
            "backend operation failed"
        );
        false
    }

    fn trip(&self, count: u32, err: &StoreError) -> bool {
        if self.disabled.swap(true, Ordering::SeqCst) {
            return false;
        }
        gauge!("repcache_backend_disabled", "backend" => self.backend).set(1.0);
        error!(
            backend = self.backend,
            consecutive_errors = count,
            error_threshold = self.threshold,
            failure_class = err.failure_class(),
            error = %err,
            "disabling backend for the rest of this process"
        );
        true
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            backend: self.backend,
            state: self.state(),
            consecutive_errors: self.consecutive_errors(),
            error_threshold: self.threshold,
        }
    }
}

/// Wraps a store with a [`BackendHealth`] breaker.
///
/// While open, every call fails with [`StoreError::Disabled`] without
/// touching the wrapped store.
pub struct GuardedStore {
    inner: Arc<dyn CacheStore>,
    health: Arc<BackendHealth>,
    operation_timeout: Duration,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn CacheStore>, error_threshold: u32) -> Self {
        let health = Arc::new(BackendHealth::new(inner.name(), error_threshold));
        Self {
            inner,
            health,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn health(&self) -> Arc<BackendHealth> {
        Arc::clone(&self.health)
    }

    async fn guard<'s, T, F, Fut>(&'s self, call: F) -> Result<T, StoreError>
    where
        F: FnOnce(&'s dyn CacheStore) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if self.health.is_disabled() {
            return Err(StoreError::Disabled {
                backend: self.health.backend(),
            });
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.operation_timeout, call(self.inner.as_ref()))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::Timeout {
                backend: self.health.backend(),
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(err) => {
                if self.health.record_failure(&err) {
                    self.inner.release().await;
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl CacheStore for GuardedStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError> {
        self.guard(|store| store.get(key, ttl)).await
    }

    async fn set(&self, key: &str, payload: &Value, ttl: Ttl) -> Result<bool, StoreError> {
        self.guard(|store| store.set(key, payload, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.guard(|store| store.delete(key)).await
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.guard(|store| store.list_keys(pattern)).await
    }

    async fn release(&self) {
        self.inner.release().await;
    }
}
