//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HUBLINK_CONFIG)
//! 3. Environment variables

use hublink_connection::config::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE, MIN_READ_BUFFER_SIZE,
};
use hublink_connection::pipe::{
    PipeOptions, DEFAULT_PAUSE_WRITER_THRESHOLD, DEFAULT_RESUME_WRITER_THRESHOLD,
};
use hublink_protocol::{DEFAULT_PORT, SUPPORTED_PROTOCOLS};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Negotiable payload protocols.
    pub protocol: ProtocolConfig,
    /// Per-connection pipe backpressure.
    pub pipe: PipeConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HUBLINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    /// Applies `HUBLINK_*` overrides looked up through `var`.
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        self.network.apply_overrides(var);
        self.protocol.apply_overrides(var);
        self.pipe.apply_overrides(var);
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.protocol.validate()?;
        self.pipe.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time a client has to send its negotiation, in seconds.
    pub negotiation_timeout_secs: u64,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Largest inbound frame, in bytes.
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            negotiation_timeout_secs: 15,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(addr) = var("HUBLINK_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(max) = var("HUBLINK_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Some(timeout) = var("HUBLINK_NEGOTIATION_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.negotiation_timeout_secs = secs;
            }
        }

        if let Some(size) = var("HUBLINK_READ_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.read_buffer_size = n;
            }
        }

        if let Some(size) = var("HUBLINK_MAX_MESSAGE_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_message_size = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be at least 1".to_string(),
            ));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "network.negotiation_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(MIN_READ_BUFFER_SIZE..=MAX_READ_BUFFER_SIZE).contains(&self.read_buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "network.read_buffer_size must be between {} and {}",
                MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE
            )));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_message_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the negotiation timeout as Duration.
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

/// Payload protocols clients may negotiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub enabled: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: SUPPORTED_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ProtocolConfig {
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        // Comma-separated, e.g. "json,cbor"
        if let Some(list) = var("HUBLINK_PROTOCOLS") {
            self.enabled = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled.is_empty() {
            return Err(ConfigError::ValidationError(
                "protocol.enabled must name at least one protocol".to_string(),
            ));
        }
        for name in &self.enabled {
            if !SUPPORTED_PROTOCOLS.contains(&name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "unknown protocol '{}' (supported: {})",
                    name,
                    SUPPORTED_PROTOCOLS.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Pipe backpressure thresholds, in bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Buffered bytes at which a writer waits (0 = unbounded).
    pub pause_writer_threshold: usize,
    /// Buffered bytes at which a waiting writer resumes.
    pub resume_writer_threshold: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            pause_writer_threshold: DEFAULT_PAUSE_WRITER_THRESHOLD,
            resume_writer_threshold: DEFAULT_RESUME_WRITER_THRESHOLD,
        }
    }
}

impl PipeConfig {
    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(pause) = var("HUBLINK_PAUSE_WRITER_THRESHOLD") {
            if let Ok(n) = pause.parse() {
                self.pause_writer_threshold = n;
            }
        }

        if let Some(resume) = var("HUBLINK_RESUME_WRITER_THRESHOLD") {
            if let Ok(n) = resume.parse() {
                self.resume_writer_threshold = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pause_writer_threshold > 0
            && self.resume_writer_threshold > self.pause_writer_threshold
        {
            return Err(ConfigError::ValidationError(format!(
                "pipe.resume_writer_threshold ({}) exceeds pipe.pause_writer_threshold ({})",
                self.resume_writer_threshold, self.pause_writer_threshold
            )));
        }
        Ok(())
    }

    /// Returns the thresholds as pipe options.
    pub fn options(&self) -> PipeOptions {
        PipeOptions::new(self.pause_writer_threshold, self.resume_writer_threshold)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
