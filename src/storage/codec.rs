//! Pluggable value encodings
//!
//! The tree adapter's file and the cache adapter's blobs are produced by a
//! [`ValueCodec`]. Callers can substitute their own implementation (for
//! example one that encrypts) without the adapters knowing.

use crate::core::error::{Result, SerializationError};
use serde_json::Value;
use std::fmt;

/// Encode/decode pair for whole values
pub trait ValueCodec: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Serialize a value to bytes
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize bytes produced by [`ValueCodec::encode`]
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Plain JSON text (the default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    /// Pretty-print output
    pub pretty: bool,
}

impl ValueCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(value)?
        } else {
            serde_json::to_vec(value)?
        };
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary MessagePack
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl ValueCodec for MessagePackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| SerializationError::from(e).into())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializationError::from(e).into())
    }
}
