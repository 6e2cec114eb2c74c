use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use repcache::cache::{
    CacheStore, HttpKvConfig, HttpKvStore, StoreError, Ttl,
    clock::{ManualClock, SharedClock},
};
use serde_json::json;
use url::Url;

const TOKEN: &str = "s3cret";

#[derive(Clone, Default)]
struct Kv {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    failing: Arc<Mutex<bool>>,
}

impl Kv {
    fn guard(&self, headers: &HeaderMap) -> Option<Response> {
        if *self.failing.lock().expect("lock") {
            return Some(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        let expected = format!("Bearer {TOKEN}");
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            == Some(expected.as_str());
        (!authorized).then(|| StatusCode::UNAUTHORIZED.into_response())
    }
}

async fn read(State(kv): State<Kv>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Some(rejection) = kv.guard(&headers) {
        return rejection;
    }
    match kv.entries.lock().expect("lock").get(&key) {
        Some(raw) => raw.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn remove(State(kv): State<Kv>, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if let Some(rejection) = kv.guard(&headers) {
        return rejection;
    }
    match kv.entries.lock().expect("lock").remove(&key) {
        Some(_) => StatusCode::OK.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn write(
    State(kv): State<Kv>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Some(rejection) = kv.guard(&headers) {
        return rejection;
    }
    match (form.get("key"), form.get("value")) {
        (Some(key), Some(value)) => {
            kv.entries
                .lock()
                .expect("lock")
                .insert(key.clone(), value.clone());
            StatusCode::OK.into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn list(
    State(kv): State<Kv>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(rejection) = kv.guard(&headers) {
        return rejection;
    }
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let keys: Vec<String> = kv
        .entries
        .lock()
        .expect("lock")
        .keys()
        .filter(|key| key.starts_with(&prefix))
        .cloned()
        .collect();
    Json(keys).into_response()
}

async fn spawn_kv() -> (Kv, SocketAddr) {
    let kv = Kv::default();
    let app = Router::new()
        .route("/", get(list).post(write))
        .route("/{key}", get(read).delete(remove))
        .with_state(kv.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("kv server");
    });
    (kv, addr)
}

fn store(addr: SocketAddr, token: Option<&str>, clock: Arc<ManualClock>) -> HttpKvStore {
    let clock: SharedClock = clock;
    HttpKvStore::with_clock(
        HttpKvConfig {
            base_url: Url::parse(&format!("http://{addr}/")).expect("url"),
            token: token.map(str::to_string),
            request_timeout: Duration::from_secs(2),
        },
        clock,
    )
    .expect("store builds")
}

#[tokio::test]
async fn writes_envelopes_and_reads_them_back() {
    let (kv, addr) = spawn_kv().await;
    let clock = Arc::new(ManualClock::default());
    let store = store(addr, Some(TOKEN), clock.clone());
    let payload = json!({ "items": [1, 2], "next": null });

    assert!(
        store
            .set("api-cache:/api/items?page=1", &payload, Ttl::minutes(5))
            .await
            .expect("set")
    );

    let raw = kv
        .entries
        .lock()
        .expect("lock")
        .get("api-cache:/api/items?page=1")
        .cloned()
        .expect("stored under the full key");
    let stored: serde_json::Value = serde_json::from_str(&raw).expect("envelope json");
    assert_eq!(stored["payload"], payload);
    assert!(stored["createdAt"].is_i64());

    let read = store
        .get("api-cache:/api/items?page=1", Ttl::minutes(5))
        .await
        .expect("get");
    assert_eq!(read, Some(payload));
}

#[tokio::test]
async fn expired_entries_are_purged_on_read() {
    let (kv, addr) = spawn_kv().await;
    let clock = Arc::new(ManualClock::default());
    let store = store(addr, Some(TOKEN), clock.clone());

    store
        .set("k", &json!("v"), Ttl::minutes(1))
        .await
        .expect("set");
    clock.advance(Duration::from_secs(61));

    // Still inside a longer window.
    assert_eq!(
        store.get("k", Ttl::minutes(10)).await.expect("get"),
        Some(json!("v"))
    );
    assert_eq!(store.get("k", Ttl::minutes(1)).await.expect("get"), None);
    assert!(kv.entries.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn corrupt_entries_read_as_misses() {
    let (kv, addr) = spawn_kv().await;
    let store = store(addr, Some(TOKEN), Arc::new(ManualClock::default()));
    kv.entries
        .lock()
        .expect("lock")
        .insert("k".to_string(), "not json".to_string());

    assert_eq!(store.get("k", Ttl::minutes(5)).await.expect("get"), None);
    assert!(kv.entries.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn delete_and_list_by_prefix() {
    let (_kv, addr) = spawn_kv().await;
    let store = store(addr, Some(TOKEN), Arc::new(ManualClock::default()));
    for key in ["api-cache:/a", "api-cache:/b", "other:/c"] {
        store.set(key, &json!(1), Ttl::minutes(5)).await.expect("set");
    }

    let mut keys = store.list_keys("api-cache:*").await.expect("list");
    keys.sort();
    assert_eq!(keys, vec!["api-cache:/a", "api-cache:/b"]);

    assert!(store.delete("api-cache:/a").await.expect("delete"));
    assert!(!store.delete("api-cache:/a").await.expect("delete"));
    assert_eq!(store.list_keys("api-cache:").await.expect("list"), vec!["api-cache:/b"]);
}

#[tokio::test]
async fn missing_token_is_an_error() {
    let (_kv, addr) = spawn_kv().await;
    let store = store(addr, None, Arc::new(ManualClock::default()));

    let err = store
        .set("k", &json!(1), Ttl::minutes(5))
        .await
        .expect_err("unauthorized");
    assert!(matches!(err, StoreError::Unavailable { .. }));
}

#[tokio::test]
async fn server_errors_surface_as_unavailable() {
    let (kv, addr) = spawn_kv().await;
    let store = store(addr, Some(TOKEN), Arc::new(ManualClock::default()));
    *kv.failing.lock().expect("lock") = true;

    let err = store
        .get("k", Ttl::minutes(5))
        .await
        .expect_err("server error");
    assert_eq!(err.failure_class(), "unavailable");
}

#[tokio::test]
async fn unreachable_endpoint_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let store = store(addr, Some(TOKEN), Arc::new(ManualClock::default()));

    let err = store
        .get("k", Ttl::minutes(5))
        .await
        .expect_err("nothing listening");
    assert!(matches!(
        err,
        StoreError::Unavailable { .. } | StoreError::Timeout { .. }
    ));
}
