//! Backend store abstraction.
//!
//! Every provider speaks [`CacheStore`]: payloads go in and out, wrapped in a
//! [`Envelope`] that records when they were written. Freshness is judged on
//! read against the caller's [`Ttl`]; an expired envelope is purged by the
//! read that finds it.

mod envelope;
mod http_kv;
mod lock;
mod memory;
mod redis_store;
mod tiered;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use envelope::Envelope;
pub use http_kv::{HttpKvConfig, HttpKvStore};
pub use memory::{DEFAULT_MEMORY_CAPACITY, MemoryStore};
pub use redis_store::{RedisConfig, RedisStore};
pub use tiered::TieredStore;

/// Entry lifetime in whole minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct Ttl(u32);

impl Ttl {
    pub const fn minutes(minutes: u32) -> Self {
        Self(minutes)
    }

    pub const fn as_minutes(self) -> u32 {
        self.0
    }

    pub const fn as_seconds(self) -> u64 {
        self.0 as u64 * 60
    }

    pub const fn as_millis(self) -> i64 {
        self.0 as i64 * 60_000
    }

    pub const fn as_duration(self) -> Duration {
        Duration::from_secs(self.as_seconds())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{backend} unavailable: {message}")]
    Unavailable {
        backend: &'static str,
        message: String,
    },
    #[error("{backend} timed out after {elapsed_ms} ms")]
    Timeout {
        backend: &'static str,
        elapsed_ms: u64,
    },
    #[error("{backend} failed fatally: {message}")]
    Fatal {
        backend: &'static str,
        message: String,
    },
    #[error("{backend} protocol error: {message}")]
    Protocol {
        backend: &'static str,
        message: String,
    },
    #[error("{backend} disabled for the rest of this process")]
    Disabled { backend: &'static str },
    #[error("no cache backend configured")]
    NoBackend,
}

impl StoreError {
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            message: message.into(),
        }
    }

    pub fn fatal(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Fatal {
            backend,
            message: message.into(),
        }
    }

    pub fn protocol(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Protocol {
            backend,
            message: message.into(),
        }
    }

    /// Failures that must open the breaker immediately, regardless of count.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled { .. })
    }

    /// Short label used as the `failure_class` log field.
    pub fn failure_class(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Fatal { .. } => "fatal",
            Self::Protocol { .. } => "protocol",
            Self::Disabled { .. } => "disabled",
            Self::NoBackend => "no_backend",
        }
    }
}

/// Uniform capability implemented by every backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stable name used in logs and health reports.
    fn name(&self) -> &'static str;

    /// Fetch the payload stored under `key` if it is no older than `ttl`.
    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError>;

    /// Store `payload` under `key`, keeping it for at least `ttl`.
    async fn set(&self, key: &str, payload: &Value, ttl: Ttl) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys beginning with `pattern`.
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Drop any held connection. Later calls may reconnect lazily.
    async fn release(&self) {}
}
