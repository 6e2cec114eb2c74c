//! Operator routes under `/_cache`. Never cached.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    cache::{BreakerState, HealthSnapshot, ReadThroughCache},
    error::HttpError,
    infra::stores::Backends,
};

use super::RouterState;

#[derive(Clone)]
pub struct OpsState {
    pub cache: Arc<ReadThroughCache>,
    pub backends: Backends,
}

pub(super) fn routes() -> Router<RouterState> {
    Router::new()
        .route("/_cache/health", get(health))
        .route("/_cache/keys", get(list_keys))
        .route("/_cache/keys/{*key}", delete(delete_key))
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    store: &'static str,
    breakers: Vec<HealthSnapshot>,
}

async fn health(State(state): State<OpsState>) -> Json<HealthBody> {
    let breakers = state.backends.health_report();
    let degraded = breakers
        .iter()
        .any(|snapshot| snapshot.state == BreakerState::Open);
    Json(HealthBody {
        status: if degraded { "degraded" } else { "ok" },
        store: state.backends.store.name(),
        breakers,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeysQuery {
    prefix: String,
}

async fn list_keys(
    State(state): State<OpsState>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<Vec<String>>, HttpError> {
    Ok(Json(state.cache.keys(&query.prefix).await?))
}

async fn delete_key(
    State(state): State<OpsState>,
    Path(key): Path<String>,
) -> Result<Response, HttpError> {
    if state.cache.invalidate(&key).await? {
        info!(key = %key, "purged via operator route");
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}
