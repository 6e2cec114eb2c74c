//! Resilient read-through cache.
//!
//! Sits in front of an expensive JSON origin and absorbs repeated reads:
//!
//! - **Keys**: deterministic, prefix-namespaced keys from path + filtered query
//! - **Stores**: Redis primary, HTTP KV fallback and an in-process memory
//!   store behind one [`CacheStore`] contract, tried in order by
//!   [`TieredStore`]
//! - **Health**: a per-process breaker that retires a failing primary for good
//! - **Middleware**: axum layer that serves hits, falls back to stale copies
//!   and writes misses back without blocking the response
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `repcache.toml`:
//!
//! ```toml
//! [cache]
//! ttl_minutes = 5
//! compression = false
//! key_prefix = "api-cache:"
//! serve_stale_on_error = true
//! stale_ttl_minutes = 60
//! # ... see config.rs for all options
//! ```

pub mod clock;
mod codec;
mod config;
mod error;
mod health;
mod keys;
mod middleware;
mod service;
pub mod store;

pub use codec::{Codec, CodecError};
pub use config::{BypassPredicate, CacheConfig, CacheHooks, ErrorCallback};
pub use error::CacheError;
pub use health::{
    BackendHealth, BreakerState, DEFAULT_ERROR_THRESHOLD, DEFAULT_OPERATION_TIMEOUT, GuardedStore,
    HealthSnapshot,
};
pub use keys::{CacheKey, KeyBuilder};
pub use middleware::{
    CDN_CACHE_CONTROL, CacheState, X_CACHE_STATUS, apply_cache_headers, bypass_requested,
    http_date, read_through_layer,
};
pub use service::{CacheStatus, Lookup, ReadThroughCache};
pub use store::{
    CacheStore, DEFAULT_MEMORY_CAPACITY, HttpKvConfig, HttpKvStore, MemoryStore, RedisConfig,
    RedisStore, StoreError, TieredStore, Ttl,
};
