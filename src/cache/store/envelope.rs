use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StoreError, Ttl};

/// Stored unit: the payload plus the moment it was written.
///
/// The TTL is deliberately not part of the envelope so the same entry can be
/// read under a longer stale window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(created_at: i64, payload: Value) -> Self {
        Self {
            created_at,
            payload,
        }
    }

    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at)
    }

    pub fn is_fresh(&self, now: i64, ttl: Ttl) -> bool {
        self.age_millis(now) <= ttl.as_millis()
    }

    pub fn to_json(&self, backend: &'static str) -> Result<String, StoreError> {
        serde_json::to_string(self)
            .map_err(|err| StoreError::protocol(backend, format!("failed to encode envelope: {err}")))
    }
}

/// Outcome of reading a serialized envelope.
pub(crate) enum Freshness {
    Fresh(Value),
    Expired { age_ms: i64 },
    Corrupt(serde_json::Error),
}

pub(crate) fn inspect(raw: &str, now: i64, ttl: Ttl) -> Freshness {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) if envelope.is_fresh(now, ttl) => Freshness::Fresh(envelope.payload),
        Ok(envelope) => Freshness::Expired {
            age_ms: envelope.age_millis(now),
        },
        Err(err) => Freshness::Corrupt(err),
    }
}
