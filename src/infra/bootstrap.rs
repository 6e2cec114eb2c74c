use std::sync::Arc;

use axum::Router;
use repcache_client::RetryClient;

use crate::{
    cache::{CacheHooks, CacheState, ReadThroughCache},
    config::Settings,
};

use super::{
    error::InfraError,
    http::{OpsState, Origin, RouterState, build_router},
    stores::{Backends, build_backends},
};

/// Long-lived cache objects shared by the proxy and the operator commands.
#[derive(Clone)]
pub struct CacheRuntime {
    pub cache: Arc<ReadThroughCache>,
    pub backends: Backends,
}

impl CacheRuntime {
    pub fn from_settings(settings: &Settings) -> Result<Self, InfraError> {
        Self::with_hooks(settings, CacheHooks::default())
    }

    pub fn with_hooks(settings: &Settings, hooks: CacheHooks) -> Result<Self, InfraError> {
        let backends = build_backends(settings)?;
        let cache = ReadThroughCache::new(Arc::clone(&backends.store), &settings.cache)
            .with_hooks(hooks);
        Ok(Self {
            cache: Arc::new(cache),
            backends,
        })
    }

    pub async fn release(&self) {
        self.cache.release().await;
    }
}

/// Router for `repcache serve`. Requires an origin.
pub fn build_proxy(settings: &Settings, runtime: &CacheRuntime) -> Result<Router, InfraError> {
    let base_url = settings
        .origin
        .base_url
        .clone()
        .ok_or_else(|| InfraError::configuration("origin.base_url is required to serve"))?;

    let client = reqwest::Client::builder()
        .user_agent(RetryClient::user_agent())
        .timeout(settings.origin.request_timeout)
        .build()
        .map_err(|err| InfraError::configuration(format!("failed to build origin client: {err}")))?;
    let origin = Origin::new(
        RetryClient::with_client(client),
        base_url,
        settings.origin.retry.clone(),
    );

    let state = RouterState {
        origin: Arc::new(origin),
        ops: OpsState {
            cache: Arc::clone(&runtime.cache),
            backends: runtime.backends.clone(),
        },
    };
    let cache = CacheState::new(settings.cache.clone(), Arc::clone(&runtime.cache));

    Ok(build_router(state, cache))
}
