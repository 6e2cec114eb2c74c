use std::num::NonZeroUsize;
use std::sync::RwLock;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use super::envelope::{Envelope, Freshness, inspect};
use super::lock::{rw_read, rw_write};
use super::{CacheStore, StoreError, Ttl};
use crate::cache::clock::{SharedClock, system_clock};

const BACKEND: &str = "memory";

pub const DEFAULT_MEMORY_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(capacity) => capacity,
    None => panic!("capacity must be non-zero"),
};

/// Process-local store with the fallback's semantics: no native expiry, the
/// envelope's `createdAt` is checked on every read.
///
/// Bounded by an LRU; the least recently used entry is evicted once
/// `capacity` keys are held.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, String>>,
    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity_and_clock(DEFAULT_MEMORY_CAPACITY, system_clock())
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::with_capacity_and_clock(capacity, system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_capacity_and_clock(DEFAULT_MEMORY_CAPACITY, clock)
    }

    pub fn with_capacity_and_clock(capacity: NonZeroUsize, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            clock,
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        rw_read(&self.entries, BACKEND, "capacity").cap()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, BACKEND, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        rw_read(&self.entries, BACKEND, "is_empty").is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        rw_read(&self.entries, BACKEND, "contains_key").contains(key)
    }

    fn insert_raw(&self, key: String, raw: String) {
        let evicted = rw_write(&self.entries, BACKEND, "set").push(key.clone(), raw);
        if let Some((evicted_key, _)) = evicted.filter(|(evicted_key, _)| *evicted_key != key) {
            counter!("repcache_memory_evict_total").increment(1);
            debug!(backend = BACKEND, key = %evicted_key, "evicted least recently used entry");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str, ttl: Ttl) -> Result<Option<Value>, StoreError> {
        let Some(raw) = rw_write(&self.entries, BACKEND, "get").get(key).cloned() else {
            return Ok(None);
        };

        match inspect(&raw, self.clock.now_millis(), ttl) {
            Freshness::Fresh(payload) => Ok(Some(payload)),
            Freshness::Expired { age_ms } => {
                debug!(backend = BACKEND, key, age_ms, "purging expired entry");
                rw_write(&self.entries, BACKEND, "purge").pop(key);
                Ok(None)
            }
            Freshness::Corrupt(err) => {
                warn!(backend = BACKEND, key, error = %err, "purging corrupt envelope");
                rw_write(&self.entries, BACKEND, "purge").pop(key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, payload: &Value, _ttl: Ttl) -> Result<bool, StoreError> {
        let envelope = Envelope::new(self.clock.now_millis(), payload.clone());
        self.insert_raw(key.to_string(), envelope.to_json(BACKEND)?);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(rw_write(&self.entries, BACKEND, "delete").pop(key).is_some())
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let prefix = pattern.trim_end_matches('*');
        let mut keys: Vec<String> = rw_read(&self.entries, BACKEND, "list_keys")
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
