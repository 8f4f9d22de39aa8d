//! Protocol negotiation handshake.
//!
//! The first frame a client sends names the payload protocol for the rest
//! of the connection. It is always JSON in a text frame, whatever the
//! chosen protocol's own transfer format is.

use crate::error::ProtocolError;
use crate::frame::{try_parse_text, write_text};
use crate::serializer::PayloadSerializer;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Handshake naming the payload protocol and its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub protocol: String,
    pub version: u32,
}

impl NegotiationMessage {
    pub fn new(protocol: impl Into<String>, version: u32) -> Self {
        Self {
            protocol: protocol.into(),
            version,
        }
    }

    pub fn for_serializer(serializer: &dyn PayloadSerializer) -> Self {
        Self::new(serializer.name(), serializer.version())
    }

    /// Encodes the handshake as a text frame.
    pub fn write(&self) -> Result<BytesMut, ProtocolError> {
        write_text(&serde_json::to_vec(self)?)
    }

    /// Parses a handshake from the front of `buf`.
    ///
    /// Returns the message and the number of bytes it occupied, or `None`
    /// if the terminator has not arrived yet.
    pub fn try_parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some(frame) = try_parse_text(buf)? else {
            return Ok(None);
        };
        if frame.payload.is_empty() {
            return Err(ProtocolError::violation("empty negotiation message"));
        }
        let message: NegotiationMessage = serde_json::from_slice(frame.payload)?;
        Ok(Some((message, frame.consumed)))
    }
}
