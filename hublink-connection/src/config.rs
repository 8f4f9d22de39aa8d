//! Client connection options.

use crate::pipe::PipeOptions;
use hublink_protocol::{JsonSerializer, TargetRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default largest frame a connection buffers before failing (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Options for [`HubClient`](crate::HubClient) connections.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time to wait for a reply to one call.
    pub request_timeout: Duration,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Payload protocol announced during negotiation.
    pub protocol: String,
    /// Backpressure of both pipe directions.
    pub pipe: PipeOptions,
    /// Largest inbound frame accepted.
    pub max_message_size: usize,
    /// Known targets of the remote hub, used to bind results.
    pub targets: Arc<TargetRegistry>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            protocol: JsonSerializer::NAME.to_string(),
            pipe: PipeOptions::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            targets: Arc::new(TargetRegistry::new()),
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_pipe_options(mut self, pipe: PipeOptions) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size.max(1);
        self
    }

    pub fn with_targets(mut self, targets: Arc<TargetRegistry>) -> Self {
        self.targets = targets;
        self
    }
}
