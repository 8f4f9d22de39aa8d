//! Hub protocol codec: hub messages to framed bytes and back.
//!
//! Every message travels as a positional array whose first element is the
//! [`MessageType`] code:
//!
//! ```text
//! invocation         [1, id | null, target, [args...]]
//! stream item        [2, id, item]
//! completion         [3, id, error | null, result | null]
//! stream invocation  [4, id, target, [args...]]
//! cancel invocation  [5, id]
//! ping               [6]
//! close              [7, error | null]
//! ```
//!
//! Trailing elements are ignored so newer peers can append fields.

use crate::binder::{ArgumentShape, InvocationBinder};
use crate::error::{BindingError, ProtocolError};
use crate::frame::TransferFormat;
use crate::message::*;
use crate::serializer::{self, CborSerializer, JsonSerializer, PayloadSerializer};
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::sync::Arc;

/// Messages decoded from a buffer plus the cursor pair to advance by.
#[derive(Debug, Default)]
pub struct DecodeResult {
    /// Complete messages, in arrival order.
    pub messages: Vec<HubMessage>,
    /// End of the last complete frame.
    pub consumed: usize,
    /// How far the buffer was inspected.
    pub examined: usize,
}

/// Encodes and decodes hub messages with one payload serializer.
#[derive(Debug, Clone)]
pub struct HubProtocolCodec {
    serializer: Arc<dyn PayloadSerializer>,
}

impl HubProtocolCodec {
    pub fn new(serializer: Arc<dyn PayloadSerializer>) -> Self {
        Self { serializer }
    }

    pub fn json() -> Self {
        Self::new(Arc::new(JsonSerializer))
    }

    pub fn cbor() -> Self {
        Self::new(Arc::new(CborSerializer))
    }

    /// Builds the codec for a negotiated protocol name.
    pub fn for_protocol(name: &str) -> Option<Self> {
        serializer::resolve(name).map(Self::new)
    }

    pub fn name(&self) -> &'static str {
        self.serializer.name()
    }

    pub fn version(&self) -> u32 {
        self.serializer.version()
    }

    pub fn transfer_format(&self) -> TransferFormat {
        self.serializer.transfer_format()
    }

    /// Encodes a message into payload bytes (unframed).
    pub fn encode(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let payload = self.serializer.serialize(&to_wire(message))?;
        Ok(Bytes::from(payload))
    }

    /// Encodes and frames a message.
    pub fn write_message(&self, message: &HubMessage) -> Result<BytesMut, ProtocolError> {
        let payload = self.encode(message)?;
        self.transfer_format().write(&payload)
    }

    /// Decodes every complete frame at the front of `buf`.
    ///
    /// Stops at the first incomplete frame. On error nothing is returned, so
    /// no message of the buffer is applied.
    pub fn decode_all(
        &self,
        buf: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<DecodeResult, ProtocolError> {
        let format = self.transfer_format();
        let mut messages = Vec::new();
        let mut consumed = 0;

        while let Some(frame) = format.try_parse(&buf[consumed..])? {
            messages.push(self.parse_message(frame.payload, binder)?);
            consumed += frame.consumed;
        }

        Ok(DecodeResult {
            messages,
            consumed,
            examined: buf.len(),
        })
    }

    /// Decodes one frame payload.
    pub fn parse_message(
        &self,
        payload: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<HubMessage, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::violation("empty message payload"));
        }

        let Value::Array(fields) = self.serializer.deserialize(payload)? else {
            return Err(ProtocolError::violation("message is not an array"));
        };
        let mut fields = WireFields::new(fields);

        let code = fields.u64("message type")?;
        let message_type = MessageType::from_code(code)
            .ok_or_else(|| ProtocolError::violation(format!("unknown message type: {}", code)))?;

        let message = match message_type {
            MessageType::Invocation => {
                let invocation_id = fields.optional_string("invocation id")?;
                let target = fields.string("target")?;
                let arguments = bind_arguments(binder, &target, fields.array("arguments")?)?;
                HubMessage::Invocation(InvocationMessage {
                    invocation_id,
                    target,
                    arguments,
                })
            }
            MessageType::StreamInvocation => {
                let invocation_id = fields.string("invocation id")?;
                let target = fields.string("target")?;
                let arguments = bind_arguments(binder, &target, fields.array("arguments")?)?;
                HubMessage::StreamInvocation(StreamInvocationMessage {
                    invocation_id,
                    target,
                    arguments,
                })
            }
            MessageType::StreamItem => {
                let invocation_id = fields.string("invocation id")?;
                let item = bind_result(binder, &invocation_id, fields.required("item")?)?;
                HubMessage::StreamItem(StreamItemMessage { invocation_id, item })
            }
            MessageType::Completion => {
                let invocation_id = fields.string("invocation id")?;
                let error = fields.optional_string("error")?;
                let result = match fields.required("result")? {
                    Value::Null => None,
                    value => Some(bind_result(binder, &invocation_id, value)?),
                };
                if error.is_some() && result.is_some() {
                    return Err(ProtocolError::violation(
                        "completion carries both an error and a result",
                    ));
                }
                HubMessage::Completion(CompletionMessage {
                    invocation_id,
                    error,
                    result,
                })
            }
            MessageType::CancelInvocation => {
                HubMessage::CancelInvocation(CancelInvocationMessage {
                    invocation_id: fields.string("invocation id")?,
                })
            }
            MessageType::Ping => HubMessage::Ping,
            MessageType::Close => HubMessage::Close(CloseMessage {
                error: fields.trailing_optional_string("error")?,
            }),
        };

        Ok(message)
    }
}

fn bind_arguments(
    binder: &dyn InvocationBinder,
    target: &str,
    arguments: Vec<Value>,
) -> Result<Vec<Value>, ProtocolError> {
    let parameters = binder
        .parameters(target)
        .ok_or_else(|| BindingError::UnknownTarget(target.to_string()))?;
    Ok(parameters.bind(target, arguments)?)
}

/// Unknown ids bind as `Any`; the correlator rejects them afterwards.
fn bind_result(
    binder: &dyn InvocationBinder,
    invocation_id: &str,
    value: Value,
) -> Result<Value, ProtocolError> {
    let shape = binder
        .return_shape(invocation_id)
        .unwrap_or(ArgumentShape::Any);
    shape.bind(value).map_err(|source| {
        ProtocolError::from(BindingError::Result {
            invocation_id: invocation_id.to_string(),
            source,
        })
    })
}

fn to_wire(message: &HubMessage) -> Value {
    let code = Value::from(message.message_type().code());
    let fields = match message {
        HubMessage::Invocation(m) => vec![
            code,
            optional_string(&m.invocation_id),
            Value::String(m.target.clone()),
            Value::Array(m.arguments.clone()),
        ],
        HubMessage::StreamInvocation(m) => vec![
            code,
            Value::String(m.invocation_id.clone()),
            Value::String(m.target.clone()),
            Value::Array(m.arguments.clone()),
        ],
        HubMessage::StreamItem(m) => vec![
            code,
            Value::String(m.invocation_id.clone()),
            m.item.clone(),
        ],
        HubMessage::Completion(m) => vec![
            code,
            Value::String(m.invocation_id.clone()),
            optional_string(&m.error),
            m.result.clone().unwrap_or(Value::Null),
        ],
        HubMessage::CancelInvocation(m) => vec![code, Value::String(m.invocation_id.clone())],
        HubMessage::Ping => vec![code],
        HubMessage::Close(m) => vec![code, optional_string(&m.error)],
    };
    Value::Array(fields)
}

fn optional_string(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

/// Positional reader over the elements of a message array.
struct WireFields {
    fields: std::vec::IntoIter<Value>,
}

impl WireFields {
    fn new(fields: Vec<Value>) -> Self {
        Self {
            fields: fields.into_iter(),
        }
    }

    fn required(&mut self, name: &'static str) -> Result<Value, ProtocolError> {
        self.fields.next().ok_or(ProtocolError::MissingField(name))
    }

    fn u64(&mut self, name: &'static str) -> Result<u64, ProtocolError> {
        self.required(name)?
            .as_u64()
            .ok_or_else(|| ProtocolError::violation(format!("{} must be an unsigned integer", name)))
    }

    fn string(&mut self, name: &'static str) -> Result<String, ProtocolError> {
        match self.required(name)? {
            Value::String(s) => Ok(s),
            _ => Err(ProtocolError::violation(format!("{} must be a string", name))),
        }
    }

    fn optional_string(&mut self, name: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.required(name)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            _ => Err(ProtocolError::violation(format!(
                "{} must be a string or null",
                name
            ))),
        }
    }

    /// Like `optional_string`, but a missing element reads as `None`.
    fn trailing_optional_string(
        &mut self,
        name: &'static str,
    ) -> Result<Option<String>, ProtocolError> {
        match self.fields.next() {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ProtocolError::violation(format!(
                "{} must be a string or null",
                name
            ))),
        }
    }

    fn array(&mut self, name: &'static str) -> Result<Vec<Value>, ProtocolError> {
        match self.required(name)? {
            Value::Array(values) => Ok(values),
            _ => Err(ProtocolError::violation(format!("{} must be an array", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{Parameters, PermissiveBinder, TargetRegistry};
    use crate::error::ErrorKind;
    use crate::frame::{write_binary, write_text};
    use serde_json::json;

    fn codecs() -> [HubProtocolCodec; 2] {
        [HubProtocolCodec::json(), HubProtocolCodec::cbor()]
    }

    fn sample_messages() -> Vec<HubMessage> {
        vec![
            InvocationMessage::new("1", "Echo", vec![json!("hi")]).into(),
            InvocationMessage::non_blocking("Log", vec![json!({"level": "info"}), json!(3)]).into(),
            StreamInvocationMessage::new("2", "Count", vec![json!(5)]).into(),
            StreamItemMessage::new("2", json!([1, 2, 3])).into(),
            CompletionMessage::with_result("1", json!("hi")).into(),
            CompletionMessage::with_error("1", "boom").into(),
            CompletionMessage::empty("2").into(),
            CancelInvocationMessage::new("2").into(),
            HubMessage::Ping,
            CloseMessage::new().into(),
            CloseMessage::with_error("server shutting down").into(),
        ]
    }

    #[test]
    fn test_roundtrip_all_messages() {
        for codec in codecs() {
            for message in sample_messages() {
                let framed = codec.write_message(&message).unwrap();
                let result = codec.decode_all(&framed, &PermissiveBinder).unwrap();

                assert_eq!(result.messages, vec![message.clone()], "{}", codec.name());
                assert_eq!(result.consumed, framed.len());
                assert_eq!(result.examined, framed.len());
            }
        }
    }

    #[test]
    fn test_json_wire_shapes() {
        let codec = HubProtocolCodec::json();
        let cases: Vec<(HubMessage, &str)> = vec![
            (
                InvocationMessage::new("1", "Echo", vec![json!("hi")]).into(),
                r#"[1,"1","Echo",["hi"]]"#,
            ),
            (
                InvocationMessage::non_blocking("Echo", vec![]).into(),
                r#"[1,null,"Echo",[]]"#,
            ),
            (StreamItemMessage::new("2", json!(7)).into(), r#"[2,"2",7]"#),
            (
                CompletionMessage::with_result("1", json!("hi")).into(),
                r#"[3,"1",null,"hi"]"#,
            ),
            (
                CompletionMessage::with_error("1", "no").into(),
                r#"[3,"1","no",null]"#,
            ),
            (
                StreamInvocationMessage::new("3", "Count", vec![json!(2)]).into(),
                r#"[4,"3","Count",[2]]"#,
            ),
            (CancelInvocationMessage::new("3").into(), r#"[5,"3"]"#),
            (HubMessage::Ping, "[6]"),
            (CloseMessage::new().into(), "[7,null]"),
        ];

        for (message, expected) in cases {
            let payload = codec.encode(&message).unwrap();
            assert_eq!(std::str::from_utf8(&payload).unwrap(), expected);
        }
    }

    #[test]
    fn test_decode_all_multiple_and_partial() {
        for codec in codecs() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&codec.write_message(&HubMessage::Ping).unwrap());
            buf.extend_from_slice(
                &codec
                    .write_message(&CompletionMessage::empty("9").into())
                    .unwrap(),
            );
            let complete_len = buf.len();
            let third = codec
                .write_message(&StreamItemMessage::new("9", json!("x")).into())
                .unwrap();
            buf.extend_from_slice(&third[..third.len() - 1]);

            let result = codec.decode_all(&buf, &PermissiveBinder).unwrap();
            assert_eq!(result.messages.len(), 2);
            assert_eq!(result.messages[0], HubMessage::Ping);
            assert_eq!(result.consumed, complete_len);
            assert_eq!(result.examined, buf.len());
        }
    }

    #[test]
    fn test_decode_all_empty_buffer() {
        let result = HubProtocolCodec::json()
            .decode_all(&[], &PermissiveBinder)
            .unwrap();
        assert!(result.messages.is_empty());
        assert_eq!(result.consumed, 0);
        assert_eq!(result.examined, 0);
    }

    #[test]
    fn test_zero_length_frame_is_violation() {
        let codec = HubProtocolCodec::cbor();
        let framed = write_binary(&[]).unwrap();
        let err = codec.decode_all(&framed, &PermissiveBinder).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

        let codec = HubProtocolCodec::json();
        let framed = write_text(&[]).unwrap();
        let err = codec.decode_all(&framed, &PermissiveBinder).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_bad_frame_discards_whole_buffer() {
        let codec = HubProtocolCodec::json();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&codec.write_message(&HubMessage::Ping).unwrap());
        buf.extend_from_slice(&write_text(b"[99]").unwrap());

        let err = codec.decode_all(&buf, &PermissiveBinder).unwrap_err();
        assert!(err.to_string().contains("unknown message type: 99"));
    }

    #[test]
    fn test_malformed_payloads() {
        let codec = HubProtocolCodec::json();
        let cases: [&[u8]; 8] = [
            b"{}",
            b"[]",
            b"[\"1\"]",
            b"[1,\"1\",\"Echo\"]",
            b"[1,\"1\",5,[]]",
            b"[3,\"1\",\"err\",\"result\"]",
            b"[2,null,1]",
            b"not json",
        ];

        for payload in cases {
            let err = codec.parse_message(payload, &PermissiveBinder).unwrap_err();
            assert_eq!(
                err.kind(),
                ErrorKind::ProtocolViolation,
                "{}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_close_without_error_field() {
        let codec = HubProtocolCodec::json();
        let message = codec.parse_message(b"[7]", &PermissiveBinder).unwrap();
        assert_eq!(message, HubMessage::Close(CloseMessage::new()));
    }

    #[test]
    fn test_trailing_fields_ignored() {
        let codec = HubProtocolCodec::json();
        let message = codec
            .parse_message(br#"[6,{"future":true}]"#, &PermissiveBinder)
            .unwrap();
        assert_eq!(message, HubMessage::Ping);
    }

    #[test]
    fn test_unknown_target_is_binding_error() {
        let codec = HubProtocolCodec::json();
        let registry = TargetRegistry::new().with_target(
            "Echo",
            Parameters::Fixed(vec![ArgumentShape::Any]),
            ArgumentShape::Any,
        );

        let err = codec
            .parse_message(br#"[1,"1","Missing",[]]"#, &registry)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BindingError);

        let err = codec
            .parse_message(br#"[4,"1","Echo",[1,2]]"#, &registry)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BindingError);

        // Replies never bind by target name
        let message = codec
            .parse_message(br#"[3,"1",null,"anything"]"#, &registry)
            .unwrap();
        assert!(matches!(message, HubMessage::Completion(_)));
    }

    #[test]
    fn test_result_bound_by_return_shape() {
        struct IntResults;
        impl InvocationBinder for IntResults {
            fn parameters(&self, _target: &str) -> Option<Parameters> {
                None
            }
            fn return_shape(&self, invocation_id: &str) -> Option<ArgumentShape> {
                (invocation_id == "1").then_some(ArgumentShape::Integer)
            }
        }

        let codec = HubProtocolCodec::cbor();
        let framed = codec
            .write_message(&CompletionMessage::with_result("1", json!(4.0)).into())
            .unwrap();
        let result = codec.decode_all(&framed, &IntResults).unwrap();
        assert_eq!(
            result.messages,
            vec![HubMessage::from(CompletionMessage::with_result("1", json!(4)))]
        );

        let framed = codec
            .write_message(&StreamItemMessage::new("1", json!("four")).into())
            .unwrap();
        let err = codec.decode_all(&framed, &IntResults).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BindingError);

        // Unknown ids bind permissively
        let framed = codec
            .write_message(&StreamItemMessage::new("2", json!("four")).into())
            .unwrap();
        assert_eq!(codec.decode_all(&framed, &IntResults).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_for_protocol() {
        assert_eq!(
            HubProtocolCodec::for_protocol("json").unwrap().transfer_format(),
            TransferFormat::Text
        );
        assert_eq!(
            HubProtocolCodec::for_protocol("cbor").unwrap().transfer_format(),
            TransferFormat::Binary
        );
        assert!(HubProtocolCodec::for_protocol("xml").is_none());
    }
}
