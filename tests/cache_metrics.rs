use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use repcache::cache::{
    CacheConfig, CacheState, CacheStore, GuardedStore, MemoryStore, ReadThroughCache, StoreError,
    TieredStore, Ttl, read_through_layer,
};
use serde_json::{Value, json};
use tower::ServiceExt;

const STALE_KEY: &str = "api-cache:/api/stale";

/// Memory store that refuses fresh reads of one key.
struct FreshReadFails {
    inner: MemoryStore,
    fresh: Ttl,
}

#[async_trait]
impl CacheStore for FreshReadFails {
    fn name(&self) -> &'static str {
        "fresh_read_fails"
    }

    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError> {
        if key == STALE_KEY && ttl == self.fresh {
            return Err(StoreError::unavailable("fresh_read_fails", "read refused"));
        }
        self.inner.get(key, ttl).await
    }

    async fn set(&self, key: &str, payload: &Value, ttl: Ttl) -> Result<bool, StoreError> {
        self.inner.set(key, payload, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys(pattern).await
    }
}

struct Unreachable;

#[async_trait]
impl CacheStore for Unreachable {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn get(&self, _key: &str, _ttl: Ttl) -> Result<Option<Value>, StoreError> {
        Err(StoreError::unavailable("unreachable", "no route to host"))
    }

    async fn set(&self, _key: &str, _payload: &Value, _ttl: Ttl) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("unreachable", "no route to host"))
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("unreachable", "no route to host"))
    }

    async fn list_keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::unavailable("unreachable", "no route to host"))
    }
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let config = CacheConfig::default();
    let fallback = FreshReadFails {
        inner: MemoryStore::new(),
        fresh: config.ttl(),
    };
    fallback
        .inner
        .set(STALE_KEY, &json!({ "old": true }), config.retention())
        .await
        .expect("seed stale entry");

    let guarded = GuardedStore::new(Arc::new(Unreachable), 1);
    let store: Arc<dyn CacheStore> = Arc::new(TieredStore::new(vec![
        Arc::new(guarded) as Arc<dyn CacheStore>,
        Arc::new(fallback) as Arc<dyn CacheStore>,
    ]));
    let cache = Arc::new(ReadThroughCache::new(store, &config));
    let state = CacheState::new(config, cache);

    let app = Router::new()
        .route("/api/fresh", get(|| async { Json(json!({ "fresh": true })) }))
        .route("/api/stale", get(|| async { Json(json!({ "old": false })) }))
        .layer(middleware::from_fn_with_state(state, read_through_layer));

    let requests = [
        ("/api/fresh", false),
        ("/api/fresh", false),
        ("/api/fresh", true),
        ("/api/stale", false),
    ];
    for (index, (uri, bypass)) in requests.into_iter().enumerate() {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if bypass {
            builder = builder.header("x-cache-bypass", "true");
        }
        let request = builder.body(Body::empty()).expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
        if index == 0 {
            // Let the detached write-back land before the hit.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    let tiny = MemoryStore::with_capacity(NonZeroUsize::new(1).expect("non-zero"));
    for key in ["api-cache:/a", "api-cache:/b"] {
        tiny.set(key, &json!(1), Ttl::minutes(5)).await.expect("set");
    }

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "repcache_cache_hit_total",
        "repcache_cache_miss_total",
        "repcache_cache_stale_total",
        "repcache_cache_bypass_total",
        "repcache_cache_backend_error_total",
        "repcache_cache_write_total",
        "repcache_backend_disabled",
        "repcache_memory_evict_total",
        "repcache_lookup_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
