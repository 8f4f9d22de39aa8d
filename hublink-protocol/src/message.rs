//! Hub message model.
//!
//! These types are independent of any payload encoding; see
//! [`crate::codec`] for the positional wire shape.

use serde_json::Value;
use std::fmt;

/// Message discriminators, written as the first element of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(MessageType::Invocation),
            2 => Some(MessageType::StreamItem),
            3 => Some(MessageType::Completion),
            4 => Some(MessageType::StreamInvocation),
            5 => Some(MessageType::CancelInvocation),
            6 => Some(MessageType::Ping),
            7 => Some(MessageType::Close),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Invocation => write!(f, "invocation"),
            MessageType::StreamItem => write!(f, "stream item"),
            MessageType::Completion => write!(f, "completion"),
            MessageType::StreamInvocation => write!(f, "stream invocation"),
            MessageType::CancelInvocation => write!(f, "cancel invocation"),
            MessageType::Ping => write!(f, "ping"),
            MessageType::Close => write!(f, "close"),
        }
    }
}

/// Invocation of a target. Without an invocation id the call is
/// fire-and-forget and never receives a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    pub fn new(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    pub fn non_blocking(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    pub fn is_non_blocking(&self) -> bool {
        self.invocation_id.is_none()
    }
}

/// Invocation of a streaming target.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocationMessage {
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<Value>,
}

impl StreamInvocationMessage {
    pub fn new(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            target: target.into(),
            arguments,
        }
    }
}

/// One item produced by a streaming invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    pub invocation_id: String,
    pub item: Value,
}

impl StreamItemMessage {
    pub fn new(invocation_id: impl Into<String>, item: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            item,
        }
    }
}

/// Terminal message of an invocation or streaming invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub invocation_id: String,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl CompletionMessage {
    /// Successful completion carrying a result.
    ///
    /// A `null` result travels as "no result" on the wire, so it is stored as `None`.
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            error: None,
            result: (!result.is_null()).then_some(result),
        }
    }

    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            error: Some(error.into()),
            result: None,
        }
    }

    /// Successful completion without a result (void targets, finished streams).
    pub fn empty(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            error: None,
            result: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Request to stop a streaming invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelInvocationMessage {
    pub invocation_id: String,
}

impl CancelInvocationMessage {
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
        }
    }
}

/// Announces that the sender is closing the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseMessage {
    pub error: Option<String>,
}

impl CloseMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

/// A typed unit of the hub protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamInvocation(StreamInvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            HubMessage::Invocation(_) => MessageType::Invocation,
            HubMessage::StreamInvocation(_) => MessageType::StreamInvocation,
            HubMessage::StreamItem(_) => MessageType::StreamItem,
            HubMessage::Completion(_) => MessageType::Completion,
            HubMessage::CancelInvocation(_) => MessageType::CancelInvocation,
            HubMessage::Ping => MessageType::Ping,
            HubMessage::Close(_) => MessageType::Close,
        }
    }

    /// Returns the correlation id, if this message carries one.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            HubMessage::Invocation(m) => m.invocation_id.as_deref(),
            HubMessage::StreamInvocation(m) => Some(&m.invocation_id),
            HubMessage::StreamItem(m) => Some(&m.invocation_id),
            HubMessage::Completion(m) => Some(&m.invocation_id),
            HubMessage::CancelInvocation(m) => Some(&m.invocation_id),
            HubMessage::Ping | HubMessage::Close(_) => None,
        }
    }

    /// Returns whether this message answers an invocation issued by the receiver.
    pub fn is_reply(&self) -> bool {
        matches!(self, HubMessage::StreamItem(_) | HubMessage::Completion(_))
    }
}

impl From<InvocationMessage> for HubMessage {
    fn from(m: InvocationMessage) -> Self {
        HubMessage::Invocation(m)
    }
}

impl From<StreamInvocationMessage> for HubMessage {
    fn from(m: StreamInvocationMessage) -> Self {
        HubMessage::StreamInvocation(m)
    }
}

impl From<StreamItemMessage> for HubMessage {
    fn from(m: StreamItemMessage) -> Self {
        HubMessage::StreamItem(m)
    }
}

impl From<CompletionMessage> for HubMessage {
    fn from(m: CompletionMessage) -> Self {
        HubMessage::Completion(m)
    }
}

impl From<CancelInvocationMessage> for HubMessage {
    fn from(m: CancelInvocationMessage) -> Self {
        HubMessage::CancelInvocation(m)
    }
}

impl From<CloseMessage> for HubMessage {
    fn from(m: CloseMessage) -> Self {
        HubMessage::Close(m)
    }
}
