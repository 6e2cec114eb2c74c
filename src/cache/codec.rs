//! Payload compression.
//!
//! When enabled, values are stored as `{"compressed": true, "data": "<b64>"}`
//! where `data` is the base64 of the gzipped JSON bytes. With compression
//! off, values are stored as-is, except objects that carry a `compressed` key
//! of their own: those are wrapped as `{"compressed": false, "value": ...}`
//! so they cannot pass for a compressed blob. Decoding never fails loudly: anything that cannot be restored is reported as a miss so
//! the caller regenerates it from origin.

use std::io::{Read, Write};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

const COMPRESSED_FLAG: &str = "compressed";
const DATA_FIELD: &str = "data";
const VALUE_FIELD: &str = "value";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to compress value: {0}")]
    Compress(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    compress: bool,
}

impl Codec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    pub fn encode(&self, value: &Value) -> Result<Value, CodecError> {
        if !self.compress {
            if value.get(COMPRESSED_FLAG).is_some() {
                return Ok(json!({ "compressed": false, "value": value }));
            }
            return Ok(value.clone());
        }

        let bytes = serde_json::to_vec(value)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        let compressed = encoder.finish()?;

        Ok(json!({ "compressed": true, "data": STANDARD.encode(compressed) }))
    }

    /// Restore a stored payload. `None` means "treat as a miss".
    ///
    /// Tagged blobs are always inflated, whatever this codec's own setting,
    /// so toggling compression does not strand existing entries.
    pub fn decode(&self, payload: Value) -> Option<Value> {
        let restored = match payload.get(COMPRESSED_FLAG) {
            Some(Value::Bool(true)) => inflate(&payload),
            Some(Value::Bool(false)) => unwrap_escaped(payload),
            _ => return Some(payload),
        };

        match restored {
            Ok(value) => Some(value),
            Err(reason) => {
                warn!(failure_class = "serialization", reason = %reason, "discarding undecodable payload");
                None
            }
        }
    }
}

fn unwrap_escaped(mut payload: Value) -> Result<Value, String> {
    payload
        .get_mut(VALUE_FIELD)
        .map(Value::take)
        .ok_or_else(|| "escaped payload without value".to_string())
}

fn inflate(payload: &Value) -> Result<Value, String> {
    let data = payload
        .get(DATA_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| "compressed payload without data".to_string())?;
    let compressed = STANDARD
        .decode(data)
        .map_err(|err| format!("invalid base64: {err}"))?;

    let mut bytes = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut bytes)
        .map_err(|err| format!("invalid gzip stream: {err}"))?;

    serde_json::from_slice(&bytes).map_err(|err| format!("invalid json: {err}"))
}
