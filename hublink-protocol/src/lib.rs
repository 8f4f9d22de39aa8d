//! # hublink-protocol
//!
//! Wire protocol for hublink, a hub remote-invocation protocol.
//!
//! This crate provides:
//! - Binary (varint length prefix) and text (record separator) framing
//! - The hub message model and its positional wire shape
//! - Pluggable payload serializers (JSON and CBOR)
//! - Argument binding against declared target signatures
//! - The negotiation handshake and the stable error taxonomy

pub mod binder;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod negotiation;
pub mod serializer;

pub use binder::{
    ArgumentShape, InvocationBinder, Parameters, PermissiveBinder, ShapeMismatch, TargetRegistry,
    TargetSignature,
};
pub use codec::{DecodeResult, HubProtocolCodec};
pub use error::{BindingError, ErrorKind, ProtocolError};
pub use frame::{RawFrame, TransferFormat, MAX_BINARY_PAYLOAD, RECORD_SEPARATOR};
pub use message::{
    CancelInvocationMessage, CloseMessage, CompletionMessage, HubMessage, InvocationMessage,
    MessageType, StreamInvocationMessage, StreamItemMessage,
};
pub use negotiation::NegotiationMessage;
pub use serializer::{CborSerializer, JsonSerializer, PayloadSerializer, SUPPORTED_PROTOCOLS};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for the hublink server.
pub const DEFAULT_PORT: u16 = 7411;
