//! Pluggable payload serializers.
//!
//! A serializer turns the positional value tree of a hub message into bytes
//! and back. It is chosen once during negotiation and fixes the transfer
//! format of the connection. This module is the only place that maps a
//! protocol name to an encoding.

use crate::error::ProtocolError;
use crate::frame::TransferFormat;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Names accepted by [`resolve`].
pub const SUPPORTED_PROTOCOLS: &[&str] = &[JsonSerializer::NAME, CborSerializer::NAME];

/// Encodes payload values for one protocol.
pub trait PayloadSerializer: Send + Sync + fmt::Debug {
    /// Protocol name announced during negotiation.
    fn name(&self) -> &'static str;

    /// Protocol version announced during negotiation.
    fn version(&self) -> u32 {
        crate::PROTOCOL_VERSION
    }

    /// Framing this encoding is carried in.
    fn transfer_format(&self) -> TransferFormat;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ProtocolError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ProtocolError>;
}

/// JSON payloads over text framing.
///
/// `serde_json` escapes every control character inside strings, so encoded
/// payloads never contain the record separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const NAME: &'static str = "json";
}

impl PayloadSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// CBOR payloads over binary framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl CborSerializer {
    pub const NAME: &'static str = "cbor";
}

impl PayloadSerializer for CborSerializer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Cbor(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        let mut reader = bytes;
        let value: Value =
            ciborium::from_reader(&mut reader).map_err(|e| ProtocolError::Cbor(e.to_string()))?;
        if !reader.is_empty() {
            return Err(ProtocolError::violation(format!(
                "{} trailing bytes after CBOR payload",
                reader.len()
            )));
        }
        Ok(value)
    }
}

/// Looks up a serializer by its negotiated protocol name.
pub fn resolve(name: &str) -> Option<Arc<dyn PayloadSerializer>> {
    match name {
        JsonSerializer::NAME => Some(Arc::new(JsonSerializer)),
        CborSerializer::NAME => Some(Arc::new(CborSerializer)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!([1, "42", "Echo", [{"nested": [1, 2.5, null, true]}, "text", -7]])
    }

    #[test]
    fn test_json_roundtrip() {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize(&sample()).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_json_never_emits_record_separator() {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize(&json!(["\u{1e}inside\u{1e}"])).unwrap();
        assert!(!bytes.contains(&crate::frame::RECORD_SEPARATOR));
    }

    #[test]
    fn test_cbor_roundtrip() {
        let serializer = CborSerializer;
        let bytes = serializer.serialize(&sample()).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_cbor_rejects_trailing_bytes() {
        let serializer = CborSerializer;
        let mut bytes = serializer.serialize(&json!([6])).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            serializer.deserialize(&bytes),
            Err(ProtocolError::Violation(_))
        ));
    }

    #[test]
    fn test_cbor_rejects_garbage() {
        let serializer = CborSerializer;
        assert!(matches!(
            serializer.deserialize(&[0xff, 0xff]),
            Err(ProtocolError::Cbor(_))
        ));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("json").unwrap().transfer_format(), TransferFormat::Text);
        assert_eq!(resolve("cbor").unwrap().transfer_format(), TransferFormat::Binary);
        assert!(resolve("messagepack").is_none());
        assert_eq!(SUPPORTED_PROTOCOLS, &["json", "cbor"]);
    }
}
