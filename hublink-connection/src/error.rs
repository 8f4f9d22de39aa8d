//! Connection error types.

use hublink_protocol::{ErrorKind, ProtocolError};
use thiserror::Error;

/// Errors raised by a duplex pipe end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe closed")]
    Closed,

    #[error("pipe canceled")]
    Canceled,

    #[error("writer already completed")]
    WriterCompleted,

    #[error("read already in progress; call advance_to first")]
    ReadInProgress,

    #[error("advance_to called without a pending read")]
    NoReadInProgress,

    #[error("invalid cursor: consumed={consumed} examined={examined} len={len}")]
    InvalidCursor {
        consumed: usize,
        examined: usize,
        len: usize,
    },
}

impl PipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipeError::Closed | PipeError::WriterCompleted => ErrorKind::TransportClosed,
            PipeError::Canceled => ErrorKind::ConnectionAborted,
            PipeError::ReadInProgress
            | PipeError::NoReadInProgress
            | PipeError::InvalidCursor { .. } => ErrorKind::ProtocolViolation,
        }
    }
}

/// Errors raised by a hub connection or client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("pipe error: {0}")]
    Pipe(#[from] PipeError),

    #[error("transport closed")]
    TransportClosed,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("connection closed by peer{}", .error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default())]
    Closed { error: Option<String> },

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("request timeout")]
    Timeout,

    #[error("invocation {invocation_id} canceled")]
    Canceled { invocation_id: String },

    #[error("invocation {invocation_id} failed: {message}")]
    Invocation {
        invocation_id: String,
        message: String,
    },
}

impl ConnectionError {
    /// Classifies this error in the stable taxonomy.
    ///
    /// Returns `None` for errors scoped to a single invocation; those leave
    /// the connection usable.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ConnectionError::Protocol(e) => Some(e.kind()),
            ConnectionError::Pipe(e) => Some(e.kind()),
            ConnectionError::Io(_)
            | ConnectionError::TransportClosed
            | ConnectionError::Closed { .. } => Some(ErrorKind::TransportClosed),
            ConnectionError::ConnectionAborted => Some(ErrorKind::ConnectionAborted),
            ConnectionError::UnsupportedProtocol(_) | ConnectionError::Negotiation(_) => {
                Some(ErrorKind::ProtocolViolation)
            }
            ConnectionError::Timeout
            | ConnectionError::Canceled { .. }
            | ConnectionError::Invocation { .. } => None,
        }
    }

    /// Returns whether the peer caused this error by sending bad bytes.
    pub fn is_peer_fault(&self) -> bool {
        self.kind().is_some_and(|k| k.is_peer_fault())
    }

    pub fn violation(message: impl Into<String>) -> Self {
        ConnectionError::Protocol(ProtocolError::violation(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hublink_protocol::BindingError;

    #[test]
    fn test_pipe_error_kinds() {
        assert_eq!(PipeError::Closed.kind(), ErrorKind::TransportClosed);
        assert_eq!(PipeError::Canceled.kind(), ErrorKind::ConnectionAborted);
        assert_eq!(
            PipeError::InvalidCursor {
                consumed: 2,
                examined: 1,
                len: 4
            }
            .kind(),
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn test_connection_error_kinds() {
        let err = ConnectionError::from(ProtocolError::MalformedLength("too long"));
        assert_eq!(err.kind(), Some(ErrorKind::MalformedLength));
        assert!(err.is_peer_fault());

        let err = ConnectionError::from(ProtocolError::from(BindingError::UnknownTarget(
            "Nope".into(),
        )));
        assert_eq!(err.kind(), Some(ErrorKind::BindingError));

        assert_eq!(
            ConnectionError::from(PipeError::Canceled).kind(),
            Some(ErrorKind::ConnectionAborted)
        );
        assert!(!ConnectionError::TransportClosed.is_peer_fault());

        let err = ConnectionError::Invocation {
            invocation_id: "1".into(),
            message: "boom".into(),
        };
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn test_closed_display() {
        let err = ConnectionError::Closed { error: None };
        assert_eq!(err.to_string(), "connection closed by peer");

        let err = ConnectionError::Closed {
            error: Some("shutting down".into()),
        };
        assert_eq!(err.to_string(), "connection closed by peer: shutting down");
    }
}
