//! # hublink-server
//!
//! TCP host for hublink.
//!
//! This crate provides:
//! - Layered configuration (defaults, YAML file, environment)
//! - The accept loop with connection limits and graceful shutdown
//! - Per-connection negotiation and hub read loops
//! - `EchoHub`, a small hub for demos and tests

pub mod config;
pub mod echo;
pub mod error;
pub mod server;

pub use config::{Config, ConfigError, NetworkConfig, PipeConfig, ProtocolConfig};
pub use echo::EchoHub;
pub use error::ServerError;
pub use server::{Server, ServerConfig, ServerStats};
