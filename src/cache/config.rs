//! Cache configuration.
//!
//! Controls the read-through middleware via the `[cache]` section of
//! `repcache.toml`. Behaviour that cannot be expressed as data (the bypass
//! predicate and the error callback) lives in [`CacheHooks`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::request::Parts;
use serde::Deserialize;

use super::error::CacheError;
use super::keys::{CacheKey, KeyBuilder};
use super::store::Ttl;

// Default values for cache configuration
const DEFAULT_TTL_MINUTES: u32 = 5;
const DEFAULT_STALE_TTL_MINUTES: u32 = 60;
const DEFAULT_KEY_PREFIX: &str = "api-cache:";
const DEFAULT_BYPASS_HEADER: &str = "x-cache-bypass";
const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_PARAM_BLACKLIST: [&str; 3] = ["_", "_t", "timestamp"];

/// Read-through cache options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Freshness window for cached responses, in minutes.
    pub ttl_minutes: u32,
    /// Gzip payloads before storing them.
    pub compression: bool,
    /// Namespace prepended to every key.
    pub key_prefix: String,
    /// Query parameters ignored when building keys.
    pub param_blacklist: Vec<String>,
    /// Request header that skips the cache when present.
    pub bypass_header: String,
    /// Serve an older copy when the backend lookup fails.
    pub serve_stale_on_error: bool,
    /// How old a copy may be when served stale, in minutes.
    pub stale_ttl_minutes: u32,
    /// Store `null` origin results too.
    pub cache_null_values: bool,
    /// Emit `Cache-Control`, `Expires` and `CDN-Cache-Control`.
    pub emit_cache_headers: bool,
    /// Development override: never touch the cache.
    pub dev_mode: bool,
    /// Upper bound on a single lookup before it counts as a backend failure.
    pub lookup_timeout_ms: u64,
    /// Upper bound on a detached write-back.
    pub write_timeout_ms: u64,
    /// Responses larger than this are passed through uncached.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: DEFAULT_TTL_MINUTES,
            compression: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            param_blacklist: DEFAULT_PARAM_BLACKLIST
                .iter()
                .map(|name| name.to_string())
                .collect(),
            bypass_header: DEFAULT_BYPASS_HEADER.to_string(),
            serve_stale_on_error: true,
            stale_ttl_minutes: DEFAULT_STALE_TTL_MINUTES,
            cache_null_values: false,
            emit_cache_headers: true,
            dev_mode: false,
            lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Ttl {
        Ttl::minutes(self.ttl_minutes)
    }

    /// Grace window for stale reads, if stale serving is on.
    pub fn stale_ttl(&self) -> Option<Ttl> {
        self.serve_stale_on_error
            .then(|| Ttl::minutes(self.stale_ttl_minutes.max(self.ttl_minutes)))
    }

    /// How long written entries must survive in the backend.
    ///
    /// Covers the stale window so a native-expiry backend keeps copies that
    /// may still be served on error.
    pub fn retention(&self) -> Ttl {
        self.stale_ttl().unwrap_or_else(|| self.ttl())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(self.key_prefix.clone(), self.param_blacklist.iter().cloned())
    }
}

pub type BypassPredicate = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&CacheKey, &CacheError) + Send + Sync>;

/// Callbacks supplied by the embedding application.
#[derive(Clone, Default)]
pub struct CacheHooks {
    pub bypass: Option<BypassPredicate>,
    pub on_error: Option<ErrorCallback>,
}

impl CacheHooks {
    pub fn with_bypass(mut self, predicate: impl Fn(&Parts) -> bool + Send + Sync + 'static) -> Self {
        self.bypass = Some(Arc::new(predicate));
        self
    }

    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&CacheKey, &CacheError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn should_bypass(&self, parts: &Parts) -> bool {
        self.bypass.as_ref().is_some_and(|predicate| predicate(parts))
    }

    pub fn report(&self, key: &CacheKey, err: &CacheError) {
        if let Some(callback) = self.on_error.as_ref() {
            callback(key, err);
        }
    }
}

impl fmt::Debug for CacheHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHooks")
            .field("bypass", &self.bypass.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_minutes, 5);
        assert!(!config.compression);
        assert_eq!(config.key_prefix, "api-cache:");
        assert_eq!(config.param_blacklist, vec!["_", "_t", "timestamp"]);
        assert_eq!(config.bypass_header, "x-cache-bypass");
        assert!(config.serve_stale_on_error);
        assert_eq!(config.stale_ttl_minutes, 60);
        assert!(!config.cache_null_values);
        assert!(config.emit_cache_headers);
        assert!(!config.dev_mode);
        assert_eq!(config.lookup_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn retention_covers_the_stale_window() {
        let config = CacheConfig::default();
        assert_eq!(config.retention(), Ttl::minutes(60));

        let no_stale = CacheConfig {
            serve_stale_on_error: false,
            ..Default::default()
        };
        assert_eq!(no_stale.stale_ttl(), None);
        assert_eq!(no_stale.retention(), Ttl::minutes(5));
    }

    #[test]
    fn stale_window_never_shorter_than_ttl() {
        let config = CacheConfig {
            ttl_minutes: 30,
            stale_ttl_minutes: 10,
            ..Default::default()
        };
        assert_eq!(config.stale_ttl(), Some(Ttl::minutes(30)));
    }

    #[test]
    fn deserializes_partial_sections() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"ttl_minutes": 15, "compression": true}"#).expect("parses");
        assert_eq!(config.ttl(), Ttl::minutes(15));
        assert!(config.compression);
        assert_eq!(config.key_prefix, "api-cache:");
    }

    #[test]
    fn hooks_default_to_no_ops() {
        let hooks = CacheHooks::default();
        let (parts, ()) = axum::http::Request::new(()).into_parts();
        assert!(!hooks.should_bypass(&parts));

        let hooks = hooks.with_bypass(|parts| parts.uri.path().starts_with("/admin"));
        let (parts, ()) = axum::http::Request::builder()
            .uri("/admin/x")
            .body(())
            .expect("request")
            .into_parts();
        assert!(hooks.should_bypass(&parts));
    }
}
