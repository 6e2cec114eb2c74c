//! HTTP surface of the proxy: cached origin forwarding plus operator routes.

mod middleware;
mod ops;
mod proxy;

use std::sync::Arc;

use axum::{Router, extract::FromRef, middleware as axum_middleware, routing::get};

pub use middleware::{RequestContext, log_responses, set_request_context};
pub use ops::OpsState;
pub use proxy::Origin;

use crate::cache::{CacheState, read_through_layer};

#[derive(Clone)]
pub struct RouterState {
    pub origin: Arc<Origin>,
    pub ops: OpsState,
}

impl FromRef<RouterState> for Arc<Origin> {
    fn from_ref(state: &RouterState) -> Self {
        Arc::clone(&state.origin)
    }
}

impl FromRef<RouterState> for OpsState {
    fn from_ref(state: &RouterState) -> Self {
        state.ops.clone()
    }
}

pub fn build_router(state: RouterState, cache: CacheState) -> Router {
    // Everything not under /_cache is forwarded and goes through the cache.
    let proxied_routes = Router::new()
        .route("/", get(proxy::forward))
        .route("/{*path}", get(proxy::forward))
        .layer(axum_middleware::from_fn_with_state(cache, read_through_layer));

    proxied_routes
        .merge(ops::routes())
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
