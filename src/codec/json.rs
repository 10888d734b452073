//! JSON codec using `serde_json`.
//!
//! Two flavours of each operation:
//!
//! - `encode` / `decode` return errors and are used where a caller can act on them
//! - `encode_lossy` / `decode_lossy` log and fall back, for the dispatch path
//!   where one bad message must not stop the consume loop

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;

/// JSON codec for envelope bodies.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode a request body into a generic JSON value.
    ///
    /// Malformed or empty input yields `Value::Null`; the request is still
    /// routed to its handler.
    pub fn decode_lossy(bytes: &[u8]) -> Value {
        match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("Ignoring undecodable request body: {}", e);
                Value::Null
            }
        }
    }

    /// Encode a reply body.
    ///
    /// On failure the error is logged and an empty body is returned.
    pub fn encode_lossy<T: serde::Serialize>(value: &T) -> Bytes {
        match serde_json::to_vec(value) {
            Ok(v) => Bytes::from(v),
            Err(e) => {
                tracing::error!("Failed to encode RPC result: {}", e);
                Bytes::new()
            }
        }
    }
}
