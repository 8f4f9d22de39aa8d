//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use hublink_connection::config::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER_SIZE};
use hublink_connection::handshake::accept_negotiation;
use hublink_connection::{socket, ConnectionContext, HubConnection, HubDispatcher, PipeOptions};
use hublink_protocol::{DEFAULT_PORT, SUPPORTED_PROTOCOLS};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time a client has to send its negotiation.
    pub negotiation_timeout: Duration,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Largest inbound frame a connection accepts.
    pub max_message_size: usize,
    /// Protocols clients may negotiate.
    pub protocols: Vec<String>,
    /// Backpressure of both pipe directions.
    pub pipe: PipeOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
            negotiation_timeout: Duration::from_secs(15),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            protocols: SUPPORTED_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            pipe: PipeOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Restricts negotiation to `protocols`.
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            negotiation_timeout: config.network.negotiation_timeout(),
            read_buffer_size: config.network.read_buffer_size,
            max_message_size: config.network.max_message_size,
            protocols: config.protocol.enabled.clone(),
            pipe: config.pipe.options(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server hosting one hub.
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<dyn HubDispatcher>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, dispatcher: Arc<dyn HubDispatcher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {} (protocols: {})",
            listener.local_addr()?,
            self.config.protocols.join(", ")
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let dispatcher = self.dispatcher.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    dispatcher,
                                    &config,
                                    &mut conn_shutdown,
                                )
                                .await;

                                match result {
                                    Ok(()) | Err(ServerError::ShuttingDown) => {}
                                    Err(e) => {
                                        tracing::debug!("Connection {} error: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Bridges the socket, then negotiates and runs the hub connection.
    async fn handle_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<dyn HubDispatcher>,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tcp_stream.set_nodelay(true).ok();
        let context =
            Arc::new(ConnectionContext::new(config.pipe, config.pipe).with_remote_addr(addr));
        tracing::info!(
            "[{}] Client connected: {} ({})",
            context.sequence(),
            addr,
            context.connection_id()
        );

        let bridge = tokio::spawn({
            let application = context.application();
            let read_buffer_size = config.read_buffer_size;
            async move { socket::bridge(tcp_stream, application, read_buffer_size).await }
        });

        let result = Self::serve_connection(&context, dispatcher, config, shutdown).await;

        // The bridge ends once the endpoint's pipe ends are complete and
        // buffered output has been flushed to the socket.
        match bridge.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("[{}] Socket bridge ended: {}", context.sequence(), e),
            Err(e) => tracing::warn!("[{}] Socket bridge task failed: {}", context.sequence(), e),
        }
        context.abort();

        result
    }

    async fn serve_connection(
        context: &Arc<ConnectionContext>,
        dispatcher: Arc<dyn HubDispatcher>,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let transport = context.transport();

        let negotiated = tokio::time::timeout(
            config.negotiation_timeout,
            accept_negotiation(&transport.input, &config.protocols),
        )
        .await;
        let codec = match negotiated {
            Ok(Ok(codec)) => codec,
            Ok(Err(e)) => {
                tracing::warn!("[{}] Negotiation failed: {}", context.sequence(), e);
                transport.complete();
                return Err(e.into());
            }
            Err(_) => {
                tracing::warn!(
                    "[{}] No negotiation within {:?}",
                    context.sequence(),
                    config.negotiation_timeout
                );
                transport.complete();
                return Err(ServerError::NegotiationTimeout(config.negotiation_timeout));
            }
        };

        context.mark_negotiated(codec.name())?;
        tracing::info!("[{}] Negotiated {}", context.sequence(), codec.name());

        let connection = Arc::new(
            HubConnection::over_transport(context.clone(), codec, dispatcher.targets())
                .with_max_message_size(config.max_message_size),
        );

        let result = tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::debug!("[{}] Closing for shutdown", context.sequence());
                let _ = connection.close(None).await;
                Err(ServerError::ShuttingDown)
            }
            result = connection.run(dispatcher.as_ref()) => result.map_err(ServerError::from),
        };

        dispatcher.disconnected(&connection).await;
        result
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
