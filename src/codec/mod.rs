//! Codec module - serialization/deserialization for envelope bodies.
//!
//! Request and reply bodies travel as JSON. [`JsonCodec`] wraps `serde_json`
//! with the strict helpers used by typed handlers and the lenient helpers used
//! by the dispatcher, which must never fail on a malformed body.
//!
//! # Example
//!
//! ```
//! use synapse_rpc::codec::JsonCodec;
//!
//! let encoded = JsonCodec::encode(&"hello").unwrap();
//! let decoded: String = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! // Garbled input decodes to JSON null instead of an error.
//! assert!(JsonCodec::decode_lossy(b"not json").is_null());
//! ```

mod json;

pub use json::JsonCodec;
