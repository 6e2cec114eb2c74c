use thiserror::Error;

use super::codec::CodecError;
use super::store::StoreError;

/// Failure reported to the error callback and to logs.
///
/// None of these ever reach the client: the middleware degrades to origin.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] StoreError),
    #[error("cache {op} timed out after {elapsed_ms} ms")]
    Timeout { op: &'static str, elapsed_ms: u64 },
    #[error(transparent)]
    Encode(#[from] CodecError),
}

impl CacheError {
    pub fn timeout(op: &'static str, elapsed_ms: u64) -> Self {
        Self::Timeout { op, elapsed_ms }
    }

    pub fn failure_class(&self) -> &'static str {
        match self {
            Self::Backend(err) => err.failure_class(),
            Self::Timeout { .. } => "timeout",
            Self::Encode(_) => "serialization",
        }
    }
}
