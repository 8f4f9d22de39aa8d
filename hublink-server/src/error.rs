//! Server error types.

use crate::config::ConfigError;
use hublink_connection::ConnectionError;
use hublink_protocol::ErrorKind;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("client did not negotiate within {0:?}")]
    NegotiationTimeout(std::time::Duration),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Protocol-level kind, when the error came from a connection.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ServerError::Connection(e) => e.kind(),
            _ => None,
        }
    }

    /// Returns whether the peer caused this error.
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, ServerError::NegotiationTimeout(_))
            || self.kind().is_some_and(|kind| kind.is_peer_fault())
    }
}
