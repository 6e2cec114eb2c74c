use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, aio::ConnectionManager};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, Freshness, inspect};
use super::{CacheStore, StoreError, Ttl};
use crate::cache::clock::{SharedClock, system_clock};

const BACKEND: &str = "redis";

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub connect_max_attempts: u32,
    pub connect_backoff_base: Duration,
    pub connect_backoff_cap: Duration,
}

/// Primary store backed by Redis with native per-key expiry.
///
/// The connection is opened on first use, see [`LazyConnection`].
pub struct RedisStore {
    client: Client,
    config: RedisConfig,
    connection: LazyConnection<ConnectionManager>,
    clock: SharedClock,
}

impl RedisStore {
    pub fn new(config: RedisConfig) -> Result<Self, StoreError> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RedisConfig, clock: SharedClock) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())
            .map_err(|err| StoreError::fatal(BACKEND, format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            config,
            connection: LazyConnection::new(),
            clock,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let client = self.client.clone();
        let config = self.config.clone();
        self.connection
            .get_or_connect(move || connect_with_backoff(client, config))
            .await
    }
}

/// Shared connection slot, filled by the first caller that needs it.
///
/// The connect runs on its own task and keeps the slot locked until it
/// settles. Concurrent first callers queue on the lock and reuse the result.
/// A caller that stops waiting, for instance on an operation timeout, does not
/// abort the attempt.
struct LazyConnection<C> {
    slot: Arc<Mutex<Option<C>>>,
}

impl<C> LazyConnection<C>
where
    C: Clone + Send + 'static,
{
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<C, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, StoreError>> + Send + 'static,
    {
        let mut guard = self.slot.clone().lock_owned().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let attempt = connect();
        let task = tokio::spawn(async move {
            let outcome = attempt.await;
            if let Ok(connection) = &outcome {
                *guard = Some(connection.clone());
            }
            outcome
        });
        task.await
            .map_err(|err| StoreError::unavailable(BACKEND, format!("connect task failed: {err}")))?
    }

    /// Drops the cached connection without waiting on an in-flight connect.
    fn clear(&self) -> bool {
        match self.slot.clone().try_lock_owned() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => {
                let slot = self.slot.clone();
                tokio::spawn(async move {
                    slot.lock().await.take();
                });
                true
            }
        }
    }
}

async fn connect_with_backoff(
    client: Client,
    config: RedisConfig,
) -> Result<ConnectionManager, StoreError> {
    let max_attempts = config.connect_max_attempts.max(1);
    let mut attempt: u32 = 1;

    loop {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(config.connect_timeout, client.get_connection_manager()).await;

        let err = match outcome {
            Ok(Ok(connection)) => {
                info!(backend = BACKEND, attempt, "connected");
                return Ok(connection);
            }
            Ok(Err(err)) => classify(err),
            Err(_) => StoreError::Timeout {
                backend: BACKEND,
                elapsed_ms: elapsed_ms(started),
            },
        };

        if !matches!(
            err,
            StoreError::Unavailable { .. } | StoreError::Timeout { .. }
        ) {
            return Err(err);
        }

        if attempt >= max_attempts {
            return Err(StoreError::fatal(
                BACKEND,
                format!("gave up connecting after {attempt} attempts: {err}"),
            ));
        }

        let delay = backoff_delay(
            attempt,
            config.connect_backoff_base,
            config.connect_backoff_cap,
        );
        warn!(
            backend = BACKEND,
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "connect failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError> {
        let mut connection = self.connection().await?;
        let raw: Option<String> = connection.get(key).await.map_err(classify)?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        match inspect(&raw, self.clock.now_millis(), ttl) {
            Freshness::Fresh(payload) => Ok(Some(payload)),
            Freshness::Expired { age_ms } => {
                debug!(backend = BACKEND, key, age_ms, "purging expired entry");
                connection.del::<_, i64>(key).await.map_err(classify)?;
                Ok(None)
            }
            Freshness::Corrupt(err) => {
                warn!(backend = BACKEND, key, error = %err, "purging corrupt envelope");
                connection.del::<_, i64>(key).await.map_err(classify)?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, payload: &Value, ttl: Ttl) -> Result<bool, StoreError> {
        let raw = Envelope::new(self.clock.now_millis(), payload.clone()).to_json(BACKEND)?;
        let mut connection = self.connection().await?;
        connection
            .set_ex::<_, _, ()>(key, raw, ttl.as_seconds().max(1))
            .await
            .map_err(classify)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection().await?;
        let removed: i64 = connection.del(key).await.map_err(classify)?;
        Ok(removed > 0)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let glob = if pattern.ends_with('*') {
            pattern.to_string()
        } else {
            format!("{pattern}*")
        };
        let mut connection = self.connection().await?;
        let mut keys: Vec<String> = connection.keys(glob).await.map_err(classify)?;
        keys.sort();
        Ok(keys)
    }

    async fn release(&self) {
        if self.connection.clear() {
            info!(backend = BACKEND, "released connection");
        }
    }
}

/// Map a Redis error onto the store taxonomy.
///
/// Connection exhaustion on the server side is fatal: retrying only makes it
/// worse.
fn classify(err: RedisError) -> StoreError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("max number of clients") || lowered.contains("too many connections") {
        return StoreError::fatal(BACKEND, message);
    }
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        return StoreError::unavailable(BACKEND, message);
    }
    StoreError::protocol(BACKEND, message)
}

pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
