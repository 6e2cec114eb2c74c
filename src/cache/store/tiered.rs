use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CacheStore, StoreError, Ttl};

const BACKEND: &str = "tiered";

/// Ordered list of providers tried in sequence.
///
/// The first provider that answers (a miss counts as an answer) ends the
/// operation. A disabled provider is skipped silently; any other failure is
/// logged and the next provider is tried.
pub struct TieredStore {
    providers: Vec<Arc<dyn CacheStore>>,
}

impl TieredStore {
    pub fn new(providers: Vec<Arc<dyn CacheStore>>) -> Self {
        Self { providers }
    }

    pub fn push(&mut self, provider: Arc<dyn CacheStore>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn CacheStore>] {
        &self.providers
    }

    async fn first_answer<'s, T, F, Fut>(
        &'s self,
        op: &'static str,
        key: &str,
        call: F,
    ) -> Result<T, StoreError>
    where
        F: Fn(&'s Arc<dyn CacheStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_error = None;
        for provider in &self.providers {
            match call(provider).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_disabled() => {
                    debug!(op, key, backend = provider.name(), "skipping disabled backend");
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!(
                        op,
                        key,
                        backend = provider.name(),
                        failure_class = err.failure_class(),
                        error = %err,
                        "backend failed, trying next"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(StoreError::NoBackend))
    }
}

#[async_trait]
impl CacheStore for TieredStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError> {
        self.first_answer("get", key, |provider| provider.get(key, ttl))
            .await
    }

    async fn set(&self, key: &str, payload: &Value, ttl: Ttl) -> Result<bool, StoreError> {
        self.first_answer("set", key, |provider| provider.set(key, payload, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.first_answer("delete", key, |provider| provider.delete(key))
            .await
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.first_answer("list_keys", pattern, |provider| provider.list_keys(pattern))
            .await
    }

    async fn release(&self) {
        for provider in &self.providers {
            provider.release().await;
        }
    }
}
