//! Assembles the configured provider chain.

use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{
        BackendHealth, CacheStore, GuardedStore, HealthSnapshot, HttpKvConfig, HttpKvStore,
        MemoryStore, RedisConfig, RedisStore, TieredStore,
    },
    config::{FallbackSettings, PrimarySettings, Settings},
};

use super::error::InfraError;

/// The tiered store plus handles onto every breaker in it.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn CacheStore>,
    pub health: Vec<Arc<BackendHealth>>,
}

impl Backends {
    pub fn health_report(&self) -> Vec<HealthSnapshot> {
        self.health.iter().map(|health| health.snapshot()).collect()
    }
}

/// Primary (breaker-guarded) → fallback → memory, skipping what is not
/// configured. The memory store is always present when nothing remote is.
pub fn build_backends(settings: &Settings) -> Result<Backends, InfraError> {
    let mut providers: Vec<Arc<dyn CacheStore>> = Vec::new();
    let mut health = Vec::new();

    if let Some(primary) = settings.primary.as_ref() {
        let redis = Arc::new(RedisStore::new(redis_config(primary))?);
        let guarded = GuardedStore::new(redis, primary.error_threshold.get())
            .with_operation_timeout(primary.operation_timeout);
        health.push(guarded.health());
        providers.push(Arc::new(guarded));
    }

    if let Some(fallback) = http_kv_config(&settings.fallback) {
        providers.push(Arc::new(HttpKvStore::new(fallback)?));
    }

    if settings.fallback.in_memory || providers.is_empty() {
        providers.push(Arc::new(MemoryStore::with_capacity(
            settings.fallback.memory_capacity,
        )));
    }

    let names: Vec<&'static str> = providers.iter().map(|provider| provider.name()).collect();
    info!(backends = ?names, "cache backends configured");

    Ok(Backends {
        store: Arc::new(TieredStore::new(providers)),
        health,
    })
}

fn redis_config(primary: &PrimarySettings) -> RedisConfig {
    RedisConfig {
        url: primary.url.clone(),
        connect_timeout: primary.connect_timeout,
        connect_max_attempts: primary.connect_max_attempts.get(),
        connect_backoff_base: primary.connect_backoff_base,
        connect_backoff_cap: primary.connect_backoff_cap,
    }
}

fn http_kv_config(fallback: &FallbackSettings) -> Option<HttpKvConfig> {
    fallback.base_url.as_ref().map(|base_url| HttpKvConfig {
        base_url: base_url.clone(),
        token: fallback.token.clone(),
        request_timeout: fallback.request_timeout,
    })
}
