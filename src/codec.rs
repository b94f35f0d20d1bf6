//! Message payload encoding.
//!
//! Published arguments are an ordered sequence of opaque values, encoded
//! as a whole and decoded positionally. The codec is pluggable; the
//! default is MessagePack with JSON available as a configuration choice.

use crate::error::{Result, StoreError};
use crate::types::Encoding;
use serde_json::Value;
use std::sync::Arc;

/// Encodes and decodes a positional argument sequence, plus single
/// values for the key/value store.
pub trait Codec: Send + Sync {
    fn encode(&self, args: &[Value]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>>;
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode_value(&self, bytes: &[u8]) -> Result<Value>;
}

/// MessagePack codec (default).
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn encode(&self, args: &[Value]) -> Result<Vec<u8>> {
        rmp_serde::to_vec(args).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// JSON codec.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, args: &[Value]) -> Result<Vec<u8>> {
        serde_json::to_vec(args).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Codec for a configured encoding.
pub fn codec_for(encoding: Encoding) -> Arc<dyn Codec> {
    match encoding {
        Encoding::Json => Arc::new(JsonCodec),
        Encoding::MessagePack => Arc::new(MessagePackCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_msgpack_roundtrip() {
        let codec = MessagePackCodec;
        let args = vec![json!("hello"), json!(42), json!({"nested": [1, 2, 3]})];
        let bytes = codec.encode(&args).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let args = vec![json!(null), json!(true), json!(1.5)];
        let bytes = codec.encode(&args).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_empty_args() {
        let codec = MessagePackCodec;
        let bytes = codec.encode(&[]).unwrap();
        assert!(codec.decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_value_roundtrip() {
        let codec = MessagePackCodec;
        let value = json!({"color": "blue", "count": 7});
        let bytes = codec.encode_value(&value).unwrap();
        assert_eq!(codec.decode_value(&bytes).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = JsonCodec;
        assert!(matches!(
            codec.decode(b"not json"),
            Err(StoreError::Decode(_))
        ));
    }
}
