//! Message framing for the binary and text wire formats.
//!
//! Binary frames carry a variable-length length prefix: 7 bits per byte,
//! least significant group first, high bit set on every byte but the last.
//!
//! ```text
//! +--------------------------+---------------------+
//! | length prefix (1-5 bytes)| payload             |
//! +--------------------------+---------------------+
//! ```
//!
//! Text frames end with the ASCII record separator, which the payload
//! encoding must never produce:
//!
//! ```text
//! +------------------------------+------+
//! | payload (no 0x1E)            | 0x1E |
//! +------------------------------+------+
//! ```
//!
//! Parsing is a pure function of the buffer. `Ok(None)` means the buffer
//! does not yet hold a whole frame and nothing was consumed.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminator of a text frame.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Longest accepted binary length prefix.
pub const MAX_LENGTH_PREFIX_SIZE: usize = 5;

/// Largest payload a binary frame can describe (the fifth prefix byte may only carry 3 bits).
pub const MAX_BINARY_PAYLOAD: usize = i32::MAX as usize;

/// Wire format used to delimit messages on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferFormat {
    /// Length-prefixed frames.
    Binary,
    /// Record-separator terminated frames.
    Text,
}

impl TransferFormat {
    /// Attempts to split one frame off the front of `buf`.
    pub fn try_parse(self, buf: &[u8]) -> Result<Option<RawFrame<'_>>, ProtocolError> {
        match self {
            TransferFormat::Binary => try_parse_binary(buf),
            TransferFormat::Text => try_parse_text(buf),
        }
    }

    /// Frames a payload.
    pub fn write(self, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        match self {
            TransferFormat::Binary => write_binary(payload),
            TransferFormat::Text => write_text(payload),
        }
    }
}

impl fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFormat::Binary => write!(f, "binary"),
            TransferFormat::Text => write!(f, "text"),
        }
    }
}

/// One frame located in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    /// Frame payload, without prefix or terminator.
    pub payload: &'a [u8],
    /// Bytes of the buffer the frame occupies.
    pub consumed: usize,
}

/// Parses a length-prefixed frame.
pub fn try_parse_binary(buf: &[u8]) -> Result<Option<RawFrame<'_>>, ProtocolError> {
    let mut length: u64 = 0;
    let mut prefix_len = 0;

    loop {
        let Some(&byte) = buf.get(prefix_len) else {
            return Ok(None);
        };

        length |= u64::from(byte & 0x7f) << (7 * prefix_len);
        prefix_len += 1;

        if byte & 0x80 == 0 {
            if prefix_len == MAX_LENGTH_PREFIX_SIZE && byte > 0x07 {
                return Err(ProtocolError::MalformedLength(
                    "length exceeds 2147483647 bytes",
                ));
            }
            break;
        }

        if prefix_len == MAX_LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::MalformedLength(
                "length prefix longer than 5 bytes",
            ));
        }
    }

    let total = prefix_len + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some(RawFrame {
        payload: &buf[prefix_len..total],
        consumed: total,
    }))
}

/// Parses a record-separator terminated frame.
pub fn try_parse_text(buf: &[u8]) -> Result<Option<RawFrame<'_>>, ProtocolError> {
    Ok(buf
        .iter()
        .position(|&b| b == RECORD_SEPARATOR)
        .map(|pos| RawFrame {
            payload: &buf[..pos],
            consumed: pos + 1,
        }))
}

/// Writes a length-prefixed frame. An empty payload still yields one frame.
pub fn write_binary(payload: &[u8]) -> Result<BytesMut, ProtocolError> {
    if payload.len() > MAX_BINARY_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_BINARY_PAYLOAD,
        });
    }

    let mut buf = BytesMut::with_capacity(MAX_LENGTH_PREFIX_SIZE + payload.len());
    put_length_prefix(&mut buf, payload.len());
    buf.put_slice(payload);
    Ok(buf)
}

/// Writes a record-separator terminated frame. An empty payload still yields one frame.
pub fn write_text(payload: &[u8]) -> Result<BytesMut, ProtocolError> {
    if let Some(pos) = payload.iter().position(|&b| b == RECORD_SEPARATOR) {
        return Err(ProtocolError::DelimiterInPayload(pos));
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(payload);
    buf.put_u8(RECORD_SEPARATOR);
    Ok(buf)
}

fn put_length_prefix(buf: &mut BytesMut, mut length: usize) {
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if length == 0 {
            break;
        }
    }
}
