//! Protocol error types and the stable error taxonomy.

use crate::binder::ShapeMismatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while framing, encoding or decoding hub messages.
///
/// "Need more data" is not an error: framing functions report it as
/// `Ok(None)` and the caller retries once more bytes have arrived.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed length prefix: {0}")]
    MalformedLength(&'static str),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("text payload contains the record separator at offset {0}")]
    DelimiterInPayload(usize),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

impl ProtocolError {
    pub fn violation(message: impl Into<String>) -> Self {
        ProtocolError::Violation(message.into())
    }

    /// Classifies this error in the stable taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::MalformedLength(_) | ProtocolError::FrameTooLarge { .. } => {
                ErrorKind::MalformedLength
            }
            ProtocolError::Binding(_) => ErrorKind::BindingError,
            ProtocolError::DelimiterInPayload(_)
            | ProtocolError::Violation(_)
            | ProtocolError::Json(_)
            | ProtocolError::Cbor(_)
            | ProtocolError::MissingField(_) => ErrorKind::ProtocolViolation,
        }
    }
}

/// Failure to materialize arguments or results into the shapes a binder expects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("target '{target}' expects {expected} argument(s), got {actual}")]
    ArgumentCount {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of '{target}': {source}")]
    Argument {
        target: String,
        index: usize,
        #[source]
        source: ShapeMismatch,
    },

    #[error("payload for invocation '{invocation_id}': {source}")]
    Result {
        invocation_id: String,
        #[source]
        source: ShapeMismatch,
    },
}

/// Stable error kinds shared by every layer of the stack.
///
/// Every kind is terminal for the connection it occurs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MalformedLength,
    ProtocolViolation,
    BindingError,
    TransportClosed,
    ConnectionAborted,
}

impl ErrorKind {
    /// Returns whether the peer caused this error by sending bad bytes.
    ///
    /// Peer faults are reported back in a `Close` message before teardown.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedLength | ErrorKind::ProtocolViolation | ErrorKind::BindingError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::MalformedLength => write!(f, "MALFORMED_LENGTH"),
            ErrorKind::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
            ErrorKind::BindingError => write!(f, "BINDING_ERROR"),
            ErrorKind::TransportClosed => write!(f, "TRANSPORT_CLOSED"),
            ErrorKind::ConnectionAborted => write!(f, "CONNECTION_ABORTED"),
        }
    }
}
