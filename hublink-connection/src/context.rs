//! Per-connection state.

use crate::error::ConnectionError;
use crate::pipe::{DuplexPipe, DuplexPipePair, PipeOptions};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process-wide sequence used to tag connections in diagnostics.
static CONNECTION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Established, negotiation not yet received.
    Connected,
    /// Payload protocol agreed.
    Negotiated,
    /// Torn down. No further traffic is valid.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Negotiated => write!(f, "negotiated"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Identity, metadata and pipes of one logical connection.
pub struct ConnectionContext {
    connection_id: String,
    sequence: u64,
    created_at: DateTime<Utc>,
    remote_addr: Option<SocketAddr>,
    user: RwLock<Option<String>>,
    items: RwLock<HashMap<String, Value>>,
    protocol: RwLock<Option<String>>,
    state: Mutex<ConnectionState>,
    token: CancellationToken,
    pipes: DuplexPipePair,
}

impl ConnectionContext {
    /// Creates a context and its pipe pair.
    pub fn new(transport_options: PipeOptions, application_options: PipeOptions) -> Self {
        let token = CancellationToken::new();
        let pipes =
            DuplexPipe::connection_pair(transport_options, application_options, token.clone());

        Self {
            connection_id: Uuid::new_v4().simple().to_string(),
            sequence: CONNECTION_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            remote_addr: None,
            user: RwLock::new(None),
            items: RwLock::new(HashMap::new()),
            protocol: RwLock::new(None),
            state: Mutex::new(ConnectionState::Connected),
            token,
            pipes,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Diagnostic sequence number, unique within the process.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Authenticated identity, populated by whoever authenticates the peer.
    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    pub fn set_user(&self, user: impl Into<String>) {
        *self.user.write() = Some(user.into());
    }

    pub fn item(&self, key: &str) -> Option<Value> {
        self.items.read().get(key).cloned()
    }

    pub fn set_item(&self, key: impl Into<String>, value: Value) {
        self.items.write().insert(key.into(), value);
    }

    /// Negotiated payload protocol name.
    pub fn protocol(&self) -> Option<String> {
        self.protocol.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Records the negotiated protocol. Allowed once, before teardown.
    pub fn mark_negotiated(&self, protocol: &str) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Connected => {
                *self.protocol.write() = Some(protocol.to_string());
                *state = ConnectionState::Negotiated;
                Ok(())
            }
            ConnectionState::Negotiated => {
                Err(ConnectionError::Negotiation("already negotiated".into()))
            }
            ConnectionState::Disconnected => Err(ConnectionError::TransportClosed),
        }
    }

    /// Marks the context torn down without canceling in-flight pipe traffic.
    ///
    /// Returns `false` if it was already disconnected.
    pub fn mark_disconnected(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Disconnected {
            return false;
        }
        *state = ConnectionState::Disconnected;
        true
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Token canceled by [`abort`](Self::abort).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Pipe used by the hub endpoint that owns this context.
    pub fn transport(&self) -> DuplexPipe {
        self.pipes.transport.clone()
    }

    /// Pipe used by the other side: a socket bridge or an in-process peer.
    pub fn application(&self) -> DuplexPipe {
        self.pipes.application.clone()
    }

    /// Cancels pending pipe operations and completes all four pipe ends.
    ///
    /// Idempotent; returns whether this call performed the teardown.
    pub fn abort(&self) -> bool {
        let first = self.mark_disconnected();
        self.token.cancel();
        self.pipes.transport.complete();
        self.pipes.application.complete();
        if first {
            tracing::debug!(
                "Connection #{} ({}) aborted",
                self.sequence,
                self.connection_id
            );
        }
        first
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("sequence", &self.sequence)
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .finish()
    }
}
