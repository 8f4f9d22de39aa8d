//! # hublink-connection
//!
//! Connection core for hublink.
//!
//! This crate provides:
//! - Duplex byte pipes with backpressure and consumed/examined cursors
//! - Per-connection context (identity, metadata, lifecycle)
//! - Invocation correlation between outbound calls and inbound replies
//! - `HubConnection`, the hub endpoint with its read loop
//! - `HubClient`, a single-outstanding-call client over TCP
//! - Socket bridging and negotiation helpers

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod pipe;
pub mod socket;

pub use client::HubClient;
pub use config::ConnectionOptions;
pub use connection::HubConnection;
pub use context::{ConnectionContext, ConnectionState};
pub use correlator::{
    DispatchOutcome, InvocationCorrelator, InvocationHandle, InvocationKind, InvocationRecord,
};
pub use dispatcher::HubDispatcher;
pub use error::{ConnectionError, PipeError};
pub use pipe::{DuplexPipe, DuplexPipePair, PipeOptions, PipeReader, PipeWriter, ReadResult};
