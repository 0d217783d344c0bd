//! Key/value codecs
//!
//! A codec turns raw broker payload bytes into a [`Value`] and back. Codecs
//! are supplied per source; when absent, [`RawCodec`] passes the bytes
//! through unchanged as `Value::Bytes`.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-message decode failure. Reported and the message skipped; never fatal
/// to the stream.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("invalid UTF-8 payload: {0}")]
    InvalidUtf8(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("codec error: {0}")]
    Other(String),
}

/// Encode failure, the write-side counterpart of `DecodeError`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodeError {
    #[error("value not encodable as {codec}: {detail}")]
    Unsupported { codec: &'static str, detail: String },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// A pair of functions: bytes → typed value and typed value → bytes.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, raw: &[u8]) -> Result<Value, DecodeError>;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodeError>;
}

/// Shared codec handle as stored on a source.
pub type SharedCodec = Arc<dyn Codec>;

/// Pass-through codec: bytes in, bytes out.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode(&self, raw: &[u8]) -> Result<Value, DecodeError> {
        Ok(Value::Bytes(raw.to_vec()))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        match value.as_bytes() {
            Some(b) => Ok(b.to_vec()),
            None => Err(EncodeError::Unsupported {
                codec: "raw",
                detail: format!("cannot emit {} as raw bytes", value.type_name()),
            }),
        }
    }
}

/// UTF-8 string codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    fn name(&self) -> &'static str {
        "utf8"
    }

    fn decode(&self, raw: &[u8]) -> Result<Value, DecodeError> {
        std::str::from_utf8(raw)
            .map(|s| Value::Str(s.to_string()))
            .map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        match value {
            Value::Str(s) => Ok(s.as_bytes().to_vec()),
            other => Ok(other.to_string().into_bytes()),
        }
    }
}

/// JSON codec built on serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, raw: &[u8]) -> Result<Value, DecodeError> {
        let json: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        Ok(Value::from_json(&json))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(&value.to_json()).map_err(|e| EncodeError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_passthrough() {
        let raw = RawCodec;
        let payload = b"\x00\x01binary".to_vec();
        let decoded = raw.decode(&payload).unwrap();
        assert_eq!(decoded, Value::Bytes(payload.clone()));
        assert_eq!(raw.encode(&decoded).unwrap(), payload);
    }

    #[test]
    fn test_utf8_codec() {
        let codec = Utf8Codec;
        assert_eq!(
            codec.decode(b"hello").unwrap(),
            Value::Str("hello".into())
        );
        assert!(matches!(
            codec.decode(&[0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let decoded = codec.decode(br#"{"user":"A","amount":10}"#).unwrap();
        assert_eq!(decoded.get("user").and_then(Value::as_str), Some("A"));
        assert_eq!(decoded.get("amount").and_then(Value::as_int), Some(10));

        let encoded = codec.encode(&decoded).unwrap();
        let round: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(round["amount"], 10);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        assert!(matches!(
            JsonCodec.decode(b"not json"),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_raw_encode_rejects_structured() {
        let err = RawCodec.encode(&Value::Int(7)).unwrap_err();
        assert!(matches!(err, EncodeError::Unsupported { codec: "raw", .. }));
    }
}
